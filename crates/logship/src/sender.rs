// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer-facing handle tying the queue, the drain timer and the disk
//! monitor together.

use crate::config::{QueueBackend, SenderConfig};
use crate::disk::DiskMonitor;
use crate::drainer::{DrainOutcome, Drainer};
use crate::errors::SenderError;
use crate::intake::{Admission, Intake};
use crate::queue::Queue;
use crate::transport::{HttpTransport, Transport};
use bytes::Bytes;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Accepts log records and ships them in the background.
///
/// Records are queued by [`send`](Sender::send) (or through
/// [`io::Write`]) and delivered by a drain cycle that runs every
/// `drain_interval`, or on demand with [`drain`](Sender::drain).
/// [`stop`](Sender::stop) performs a last drain and closes the queue;
/// dropping a sender without stopping it only halts the background tasks.
pub struct Sender {
    config: SenderConfig,
    intake: Arc<Intake>,
    drainer: Arc<Drainer>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Sender {
    /// Starts a sender delivering over HTTP. Must be called from within a
    /// Tokio runtime.
    pub fn new(config: SenderConfig) -> Result<Self, SenderError> {
        config.validate()?;
        let transport = HttpTransport::new(&config)?;
        Self::start(config, Arc::new(transport))
    }

    /// Starts a sender delivering through `transport`.
    pub fn with_transport(
        config: SenderConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SenderError> {
        config.validate()?;
        Self::start(config, transport)
    }

    fn start(config: SenderConfig, transport: Arc<dyn Transport>) -> Result<Self, SenderError> {
        let runtime = Handle::try_current().map_err(|_| SenderError::NoRuntime)?;

        let queue = Queue::open(&config.backend).map_err(|source| SenderError::StorageOpen {
            path: storage_path(&config.backend),
            source,
        })?;

        let disk_full = Arc::new(AtomicBool::new(false));
        let intake = Arc::new(Intake::new(queue, Arc::clone(&disk_full)));
        let drainer = Arc::new(Drainer::new(Arc::clone(&intake), transport));
        let cancel = CancellationToken::new();

        let mut tasks = vec![runtime.spawn(run_drain_timer(
            Arc::clone(&drainer),
            config.drain_interval,
            cancel.clone(),
        ))];

        if config.disk_monitor_enabled() {
            if let Some(dir) = intake.queue().storage_dir() {
                let monitor = DiskMonitor::new(
                    dir,
                    config.disk_threshold,
                    config.disk_check_interval,
                    disk_full,
                );
                tasks.push(runtime.spawn(monitor.run(cancel.clone())));
            }
        } else {
            debug!("Disk space check disabled");
        }

        info!(
            "Sender started: shipping to {} every {:?} from {} queue",
            config.url,
            config.drain_interval,
            if config.backend.is_durable() {
                "durable"
            } else {
                "in-memory"
            }
        );

        Ok(Sender {
            config,
            intake,
            drainer,
            cancel,
            tasks,
        })
    }

    /// Queues one record. Drops it instead when the disk is flagged full or
    /// the queue has no room; never blocks.
    pub fn send(&self, record: impl Into<Bytes>) -> Admission {
        self.intake.admit(record.into())
    }

    /// Runs a drain cycle now.
    pub async fn drain(&self) -> DrainOutcome {
        self.drainer.drain().await
    }

    pub async fn sync(&self) {
        self.drain().await;
    }

    /// Stops the background tasks, drains one last time and closes the
    /// queue. Whatever could not be delivered stays in a durable queue for
    /// the next start.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("Background task failed: {e}");
            }
        }

        let outcome = self.drainer.drain().await;
        debug!("Final drain: {outcome:?}");
        self.intake.queue().close();
        info!("Sender stopped");
    }

    #[must_use]
    pub fn queue(&self) -> &Queue {
        self.intake.queue()
    }

    pub fn is_disk_full(&self) -> bool {
        self.intake.is_disk_full()
    }

    #[must_use]
    pub fn config(&self) -> &SenderConfig {
        &self.config
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl io::Write for Sender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(Bytes::copy_from_slice(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for &Sender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(Bytes::copy_from_slice(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

async fn run_drain_timer(drainer: Arc<Drainer>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("Drain timer stopped");
                return;
            }
            _ = ticker.tick() => {
                drainer.drain().await;
            }
        }
    }
}

fn storage_path(backend: &QueueBackend) -> PathBuf {
    match backend {
        QueueBackend::Durable { dir, .. } => dir.clone(),
        QueueBackend::InMemory { .. } => PathBuf::new(),
    }
}
