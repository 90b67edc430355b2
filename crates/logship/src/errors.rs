// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors returned by the queue backends.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Nothing to dequeue. The normal end of a drain loop, not a fault.
    #[error("queue is empty")]
    Empty,

    #[error("queue is closed")]
    Closed,

    #[error("record of {0} bytes does not fit in a queue frame")]
    RecordTooLarge(usize),

    #[error("corrupt frame in segment {segment} at offset {offset}")]
    Corrupt { segment: u64, offset: u64 },

    #[error("queue storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced while constructing a [`Sender`](crate::sender::Sender).
///
/// Once a sender is running nothing is propagated to producers; drain
/// failures are recovered by requeueing.
#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to open queue storage at {}: {source}", path.display())]
    StorageOpen {
        path: PathBuf,
        #[source]
        source: QueueError,
    },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("Sender must be created from within a Tokio runtime")]
    NoRuntime,
}
