// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Limits and defaults shared by the queue, drainer and sender.

use std::time::Duration;

/// Maximum size in bytes of a single delivered batch, delimiters included.
///
/// Independent of the queue capacity: a drain cycle stops pulling records
/// once the next record (plus its delimiter) would not fit.
pub const MAX_BATCH_SIZE_BYTES: usize = 3 * 1_024 * 1_024;

/// Default byte capacity of the in-memory queue.
pub const DEFAULT_IN_MEMORY_CAPACITY: u64 = 3 * 1_024 * 1_024;

/// Byte appended after every record when a batch is assembled.
pub const RECORD_DELIMITER: u8 = b'\n';

pub const DEFAULT_LISTENER_URL: &str = "https://listener.logz.io:8071";

pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(5);

pub const DEFAULT_DISK_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Used-space percentage above which the durable queue stops admitting records.
pub const DEFAULT_DISK_USED_PERCENT_THRESHOLD: f64 = 70.0;

pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Directory name created under the system temp dir for durable buffers.
pub const DEFAULT_BUFFER_DIR_NAME: &str = "logship-buffer";

/// A durable segment is rolled once it grows past this many bytes.
pub(crate) const SEGMENT_ROLL_BYTES: u64 = 16 * 1_024 * 1_024;
