// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! FIFO of raw log records, backed either by process memory or by disk.

pub mod durable;
pub mod memory;

use crate::config::QueueBackend;
use crate::errors::QueueError;
use bytes::Bytes;
use std::path::Path;
use tracing::error;

pub use durable::DurableQueue;
pub use memory::MemoryQueue;

/// A record together with the identifier its backend assigned on enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: u64,
    pub payload: Bytes,
}

#[derive(Debug)]
pub enum Queue {
    Memory(MemoryQueue),
    Durable(DurableQueue),
}

impl Queue {
    pub fn open(backend: &QueueBackend) -> Result<Self, QueueError> {
        match backend {
            QueueBackend::InMemory { capacity } => Ok(Queue::Memory(MemoryQueue::new(*capacity))),
            QueueBackend::Durable { dir, sync_writes } => {
                Ok(Queue::Durable(DurableQueue::open(dir, *sync_writes)?))
            }
        }
    }

    /// `Ok(None)` means the record was rejected for capacity and the queue
    /// is unchanged.
    pub fn enqueue(&self, payload: Bytes) -> Result<Option<QueueItem>, QueueError> {
        match self {
            Queue::Memory(queue) => queue.enqueue(payload),
            Queue::Durable(queue) => queue.enqueue(payload).map(Some),
        }
    }

    pub fn dequeue(&self) -> Result<QueueItem, QueueError> {
        match self {
            Queue::Memory(queue) => queue.dequeue(),
            Queue::Durable(queue) => queue.dequeue(),
        }
    }

    /// Occupied bytes, not the number of records.
    pub fn length(&self) -> u64 {
        match self {
            Queue::Memory(queue) => queue.length(),
            Queue::Durable(queue) => queue.length(),
        }
    }

    pub fn item_count(&self) -> u64 {
        match self {
            Queue::Memory(queue) => queue.item_count(),
            Queue::Durable(queue) => queue.item_count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.item_count() == 0
    }

    pub fn close(&self) {
        match self {
            Queue::Memory(queue) => queue.close(),
            Queue::Durable(queue) => {
                if let Err(e) = queue.close() {
                    error!("Failed to close queue at {}: {e}", queue.dir().display());
                }
            }
        }
    }

    /// Directory holding the records, for the durable backend.
    pub fn storage_dir(&self) -> Option<&Path> {
        match self {
            Queue::Memory(_) => None,
            Queue::Durable(queue) => Some(queue.dir()),
        }
    }
}
