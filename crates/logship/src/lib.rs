// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # logship
//!
//! A buffering, retrying log shipper. Producers hand discrete records to a
//! [`Sender`]; records wait in a queue and are periodically batched,
//! newline-delimited, and POSTed to a collector. Failed batches go back on
//! the queue and are retried on the next drain.
//!
//! ## Modules
//!
//! - [`queue`]: the in-memory and durable (on-disk) backends behind one facade
//! - [`intake`]: admission control in front of the queue
//! - [`drainer`]: the batch, deliver, requeue cycle
//! - [`disk`]: the disk-space guard for the durable backend
//! - [`transport`]: batch delivery over HTTP
//! - [`sender`]: the producer-facing handle and its lifecycle
//! - [`config`], [`errors`], [`constants`], [`logger`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use logship::{QueueBackend, Sender, SenderConfig};
//!
//! # async fn run() -> Result<(), logship::SenderError> {
//! let config = SenderConfig {
//!     token: "my-token".to_string(),
//!     backend: QueueBackend::InMemory { capacity: 3 * 1024 * 1024 },
//!     ..SenderConfig::default()
//! };
//! let sender = Sender::new(config)?;
//! sender.send("hello world");
//! sender.stop().await;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod constants;
pub mod disk;
pub mod drainer;
pub mod errors;
pub mod intake;
pub mod logger;
pub mod queue;
pub mod sender;
pub mod transport;

pub use config::{DiskThreshold, QueueBackend, SenderConfig};
pub use drainer::DrainOutcome;
pub use errors::{QueueError, SenderError};
pub use intake::Admission;
pub use queue::{Queue, QueueItem};
pub use sender::Sender;
pub use transport::{Delivery, HttpTransport, Transport, TransportError};
