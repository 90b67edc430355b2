// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The drain cycle: pull records off the queue into one size-bounded batch,
//! deliver it, and put it back on the queue if delivery fails.

use crate::constants::{MAX_BATCH_SIZE_BYTES, RECORD_DELIMITER};
use crate::errors::QueueError;
use crate::intake::{Admission, Intake};
use crate::queue::Queue;
use crate::transport::Transport;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;
use tracing::{debug, error, warn, Span};

/// Result of one call to [`Drainer::drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another cycle was already running.
    Skipped,
    /// Nothing to send.
    Empty,
    Delivered { records: usize, bytes: usize },
    /// Delivery failed and the batch went back on the queue as one record.
    Requeued { records: usize, bytes: usize },
}

pub struct Drainer {
    intake: Arc<Intake>,
    transport: Arc<dyn Transport>,
    draining: AtomicBool,
    batch: Mutex<BytesMut>,
    max_batch_bytes: usize,
}

/// Clears the draining flag however the cycle ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Drainer {
    pub fn new(intake: Arc<Intake>, transport: Arc<dyn Transport>) -> Self {
        Self::with_max_batch_bytes(intake, transport, MAX_BATCH_SIZE_BYTES)
    }

    pub(crate) fn with_max_batch_bytes(
        intake: Arc<Intake>,
        transport: Arc<dyn Transport>,
        max_batch_bytes: usize,
    ) -> Self {
        Drainer {
            intake,
            transport,
            draining: AtomicBool::new(false),
            batch: Mutex::new(BytesMut::new()),
            max_batch_bytes,
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Runs one drain cycle, or returns [`DrainOutcome::Skipped`] right away
    /// if one is already in progress.
    pub async fn drain(&self) -> DrainOutcome {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain already in progress, skipping");
            return DrainOutcome::Skipped;
        }
        let _guard = DrainGuard(&self.draining);

        let mut batch = self.batch.lock().await;
        batch.clear();

        // Durable dequeues rewrite the cursor file on every record.
        let intake = Arc::clone(&self.intake);
        let max_batch_bytes = self.max_batch_bytes;
        let mut buffer = std::mem::take(&mut *batch);
        let span = Span::current();
        let filled = spawn_blocking(move || {
            span.in_scope(|| {
                let records = fill(intake.queue(), &mut buffer, max_batch_bytes);
                (buffer, records)
            })
        })
        .await;
        let records = match filled {
            Ok((buffer, records)) => {
                *batch = buffer;
                records
            }
            Err(e) => {
                error!("Batch assembly failed, dequeued records lost: {e}");
                return DrainOutcome::Empty;
            }
        };
        if batch.is_empty() {
            return DrainOutcome::Empty;
        }

        let payload = batch.split().freeze();
        let bytes = payload.len();
        debug!("Delivering batch of {records} records ({bytes} bytes)");

        match self.transport.deliver(payload.clone()).await {
            Ok(delivery) if delivery.is_accepted() => {
                debug!("Delivered {records} records ({bytes} bytes)");
                DrainOutcome::Delivered { records, bytes }
            }
            Ok(delivery) => {
                error!(
                    "Collector rejected batch of {bytes} bytes with {}: {}",
                    delivery.status, delivery.body
                );
                self.requeue(payload);
                DrainOutcome::Requeued { records, bytes }
            }
            Err(e) => {
                warn!("Failed to deliver batch of {bytes} bytes: {e}");
                self.requeue(payload);
                DrainOutcome::Requeued { records, bytes }
            }
        }
    }

    fn requeue(&self, payload: Bytes) {
        let bytes = payload.len();
        match self.intake.admit(payload) {
            Admission::Queued(id) => debug!("Requeued batch of {bytes} bytes as record {id}"),
            rejected => error!("Failed to requeue batch of {bytes} bytes ({rejected:?}), batch lost"),
        }
    }
}

/// Moves records from `queue` into `batch` until it is full or the queue
/// runs dry. Returns the number of records taken.
///
/// A record that would overflow a non-empty batch is dropped. The first
/// record of a batch is always taken, so a requeued batch, which is one
/// delimiter longer than when it was sent, is retried on its own.
fn fill(queue: &Queue, batch: &mut BytesMut, max_batch_bytes: usize) -> usize {
    let mut records = 0;
    while batch.len() < max_batch_bytes {
        let item = match queue.dequeue() {
            Ok(item) => item,
            Err(QueueError::Empty) => break,
            Err(e) => {
                error!("Failed to dequeue record: {e}");
                break;
            }
        };

        // The record has already left the queue and is not put back.
        if !batch.is_empty() && batch.len() + item.payload.len() + 1 > max_batch_bytes {
            warn!(
                "Record {} of {} bytes does not fit in the batch, discarding it",
                item.id,
                item.payload.len()
            );
            break;
        }

        batch.extend_from_slice(&item.payload);
        batch.put_u8(RECORD_DELIMITER);
        records += 1;
    }
    records
}
