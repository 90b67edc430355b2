// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::QueueError;
use crate::queue::QueueItem;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Volatile FIFO bounded by the total byte length of its records.
///
/// Neither `enqueue` nor `dequeue` ever waits: a full queue rejects, an
/// empty queue returns [`QueueError::Empty`].
#[derive(Debug)]
pub struct MemoryQueue {
    capacity: u64,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    items: VecDeque<QueueItem>,
    size: u64,
    next_id: u64,
    closed: bool,
}

impl MemoryQueue {
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        MemoryQueue {
            capacity,
            state: Mutex::new(State {
                items: VecDeque::new(),
                size: 0,
                next_id: 1,
                closed: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Every mutation leaves State consistent before it can panic, so a
        // poisoned lock still guards valid data.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `payload` at the tail.
    ///
    /// Returns `Ok(None)` without touching the queue when the record would
    /// push the occupied size past the capacity.
    pub fn enqueue(&self, payload: Bytes) -> Result<Option<QueueItem>, QueueError> {
        let mut state = self.state();
        if state.closed {
            return Err(QueueError::Closed);
        }

        let len = payload.len() as u64;
        if state.size.saturating_add(len) > self.capacity {
            debug!(
                "Queue is full, dropping record of {len} bytes ({} of {} bytes used)",
                state.size, self.capacity
            );
            return Ok(None);
        }

        let item = QueueItem {
            id: state.next_id,
            payload,
        };
        state.next_id += 1;
        state.size += len;
        state.items.push_back(item.clone());
        Ok(Some(item))
    }

    pub fn dequeue(&self) -> Result<QueueItem, QueueError> {
        let mut state = self.state();
        if state.closed {
            return Err(QueueError::Closed);
        }

        let item = state.items.pop_front().ok_or(QueueError::Empty)?;
        state.size -= item.payload.len() as u64;
        Ok(item)
    }

    /// Occupied bytes.
    pub fn length(&self) -> u64 {
        self.state().size
    }

    pub fn item_count(&self) -> u64 {
        self.state().items.len() as u64
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Discards everything still queued. Later operations return
    /// [`QueueError::Closed`].
    pub fn close(&self) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        let dropped = state.items.len();
        state.items.clear();
        state.size = 0;
        state.closed = true;
        if dropped > 0 {
            debug!("Closed in-memory queue, discarding {dropped} records");
        }
    }
}
