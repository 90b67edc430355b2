// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::queue::Queue;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// What happened to a record handed to [`Intake::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Queued under this identifier.
    Queued(u64),
    /// Dropped: the disk holding the durable queue is over its threshold.
    DiskFull,
    /// Dropped: the in-memory queue has no room for it.
    QueueFull,
    /// Dropped: the queue failed to store it.
    Failed,
}

impl Admission {
    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self, Admission::Queued(_))
    }
}

/// Admission control in front of the queue, shared by producers and by the
/// drainer when it requeues.
#[derive(Debug)]
pub struct Intake {
    queue: Queue,
    disk_full: Arc<AtomicBool>,
}

impl Intake {
    pub fn new(queue: Queue, disk_full: Arc<AtomicBool>) -> Self {
        Intake { queue, disk_full }
    }

    /// Queues `payload` unless the disk is flagged full or the queue has no
    /// room. Never blocks and never fails the caller.
    pub fn admit(&self, payload: Bytes) -> Admission {
        if self.disk_full.load(Ordering::Relaxed) {
            debug!("Disk is full, dropping record of {} bytes", payload.len());
            return Admission::DiskFull;
        }

        match self.queue.enqueue(payload) {
            Ok(Some(item)) => Admission::Queued(item.id),
            Ok(None) => Admission::QueueFull,
            Err(e) => {
                error!("Failed to queue record: {e}");
                Admission::Failed
            }
        }
    }

    #[must_use]
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn is_disk_full(&self) -> bool {
        self.disk_full.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueBackend;

    fn memory_intake(capacity: u64) -> (Intake, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        let queue = Queue::open(&QueueBackend::InMemory { capacity }).unwrap();
        (Intake::new(queue, Arc::clone(&flag)), flag)
    }

    #[test]
    fn test_admit_queues_record() {
        let (intake, _) = memory_intake(1024);
        assert_eq!(intake.admit(Bytes::from("blah")), Admission::Queued(1));
        assert_eq!(intake.queue().length(), 4);
    }

    #[test]
    fn test_admit_drops_when_disk_full() {
        let (intake, flag) = memory_intake(1024);
        flag.store(true, Ordering::Relaxed);
        assert!(intake.is_disk_full());
        assert_eq!(intake.admit(Bytes::from("blah")), Admission::DiskFull);
        assert_eq!(intake.queue().length(), 0);

        flag.store(false, Ordering::Relaxed);
        assert!(intake.admit(Bytes::from("blah")).is_queued());
    }

    #[test]
    fn test_admit_reports_capacity_rejection() {
        let (intake, _) = memory_intake(500);
        assert_eq!(intake.admit(Bytes::from(vec![0u8; 1000])), Admission::QueueFull);
        assert!(intake.admit(Bytes::from(vec![0u8; 200])).is_queued());
        assert_eq!(intake.admit(Bytes::from(vec![0u8; 400])), Admission::QueueFull);
        assert_eq!(intake.queue().length(), 200);
    }

    #[test]
    fn test_admit_after_close_fails() {
        let (intake, _) = memory_intake(1024);
        intake.queue().close();
        assert_eq!(intake.admit(Bytes::from("late")), Admission::Failed);
    }
}
