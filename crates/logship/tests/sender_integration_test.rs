// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use logship::{Admission, DiskThreshold, DrainOutcome, QueueBackend, QueueError, Sender, SenderConfig};
use mockito::{Matcher, Server};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

const LONG_DRAIN_INTERVAL: Duration = Duration::from_secs(3600);

fn base_config(url: String, backend: QueueBackend) -> SenderConfig {
    SenderConfig {
        token: "fake-token".to_string(),
        url,
        drain_interval: LONG_DRAIN_INTERVAL,
        backend,
        check_disk_space: false,
        timeout: Duration::from_secs(2),
        ..SenderConfig::default()
    }
}

fn durable(dir: &TempDir) -> QueueBackend {
    QueueBackend::Durable {
        dir: dir.path().to_path_buf(),
        sync_writes: false,
    }
}

/// URL of a local port nothing listens on.
fn unreachable_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let port = listener.local_addr().expect("no local addr").port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}

#[tokio::test]
async fn durable_queue_keeps_undelivered_batch_across_restart() {
    let dir = TempDir::new().expect("failed to create temp dir");

    let sender = Sender::new(base_config(unreachable_url(), durable(&dir)))
        .expect("failed to start sender");
    assert!(sender.send("blah").is_queued());
    sender.stop().await;

    let sender = Sender::new(base_config(unreachable_url(), durable(&dir)))
        .expect("failed to restart sender");
    assert_eq!(sender.queue().item_count(), 1);

    let item = sender.queue().dequeue().expect("requeued batch missing");
    assert_eq!(item.payload, "blah\n");
    assert_eq!(item.id, 2);
}

#[tokio::test]
async fn in_memory_queue_rejects_records_over_capacity() {
    let sender = Sender::new(base_config(
        unreachable_url(),
        QueueBackend::InMemory { capacity: 500 },
    ))
    .expect("failed to start sender");

    assert_eq!(sender.send(vec![b'a'; 1000]), Admission::QueueFull);
    assert_eq!(sender.queue().length(), 0);

    assert!(sender.send(vec![b'a'; 200]).is_queued());
    assert_eq!(sender.send(vec![b'a'; 400]), Admission::QueueFull);
    assert_eq!(sender.queue().length(), 200);
}

#[tokio::test]
async fn failing_destination_requeues_batch_as_single_record() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/")
        .match_query(Matcher::Any)
        .with_status(500)
        .with_body("Internal Server Error")
        .create_async()
        .await;

    let sender = Sender::new(base_config(
        server.url(),
        QueueBackend::InMemory { capacity: 1024 },
    ))
    .expect("failed to start sender");

    sender.send("blah");
    assert!(matches!(
        sender.drain().await,
        DrainOutcome::Requeued { records: 1, .. }
    ));

    assert_eq!(sender.queue().item_count(), 1);
    assert!(sender.queue().dequeue().is_ok());
    assert!(matches!(sender.queue().dequeue(), Err(QueueError::Empty)));
}

#[tokio::test]
async fn working_destination_receives_all_records() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_query(Matcher::UrlEncoded("token".into(), "fake-token".into()))
        .match_header("content-type", "text/plain")
        .match_body("blah\n".repeat(100).as_str())
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let sender = Sender::new(base_config(
        server.url(),
        QueueBackend::InMemory { capacity: 1024 * 1024 },
    ))
    .expect("failed to start sender");

    for _ in 0..100 {
        sender.send("blah");
    }
    assert_eq!(sender.queue().length(), 400);

    assert_eq!(
        sender.drain().await,
        DrainOutcome::Delivered {
            records: 100,
            bytes: 500
        }
    );
    assert_eq!(sender.queue().length(), 0);
    mock.assert_async().await;
}

#[tokio::test]
async fn unauthorized_batch_is_retried_on_next_drain() {
    let mut server = Server::new_async().await;
    let rejected = server
        .mock("POST", "/")
        .match_query(Matcher::Any)
        .with_status(401)
        .with_body("bad token")
        .create_async()
        .await;

    let dir = TempDir::new().expect("failed to create temp dir");
    let sender =
        Sender::new(base_config(server.url(), durable(&dir))).expect("failed to start sender");

    sender.send("blah");
    assert!(matches!(sender.drain().await, DrainOutcome::Requeued { .. }));
    rejected.remove_async().await;

    let accepted = server
        .mock("POST", "/")
        .match_query(Matcher::UrlEncoded("token".into(), "fake-token".into()))
        .match_body("blah\n\n")
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    assert!(matches!(sender.drain().await, DrainOutcome::Delivered { .. }));
    accepted.assert_async().await;
    assert!(sender.queue().is_empty());
    sender.stop().await;
}

#[tokio::test]
async fn concurrent_producers_are_all_accounted_for() {
    let sender = Sender::new(base_config(
        unreachable_url(),
        QueueBackend::InMemory { capacity: 1024 * 1024 },
    ))
    .expect("failed to start sender");

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..100 {
                    sender.send("blah");
                }
            });
        }
    });

    assert_eq!(sender.queue().item_count(), 800);
    assert_eq!(sender.queue().length(), 3200);
}

#[cfg(not(target_os = "windows"))]
#[tokio::test]
async fn disk_threshold_drops_records() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = SenderConfig {
        check_disk_space: true,
        disk_threshold: DiskThreshold::MinFreeBytes(u64::MAX),
        disk_check_interval: Duration::from_secs(1),
        ..base_config(unreachable_url(), durable(&dir))
    };
    let sender = Sender::new(config).expect("failed to start sender");

    let flagged = timeout(Duration::from_secs(5), async {
        while !sender.is_disk_full() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(flagged.is_ok(), "disk never flagged full");

    assert_eq!(sender.send("blah"), Admission::DiskFull);
    assert_eq!(sender.queue().length(), 0);
}

#[tokio::test]
async fn disabled_disk_check_admits_records() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = SenderConfig {
        check_disk_space: false,
        disk_threshold: DiskThreshold::MinFreeBytes(u64::MAX),
        disk_check_interval: Duration::from_secs(1),
        ..base_config(unreachable_url(), durable(&dir))
    };
    let sender = Sender::new(config).expect("failed to start sender");

    sleep(Duration::from_millis(50)).await;
    assert!(!sender.is_disk_full());
    assert!(sender.send("blah").is_queued());
    assert_eq!(sender.queue().length(), 4);
}
