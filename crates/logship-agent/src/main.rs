// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::process::ExitCode;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logship::{logger::Formatter, Sender, SenderConfig};

const DEFAULT_LOG_LEVEL: &str = "info";

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("LOGSHIP_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or(DEFAULT_LOG_LEVEL.to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,reqwest=off,{log_level}");
    let env_filter = EnvFilter::try_new(&env_filter).unwrap_or_else(|e| {
        eprintln!("Invalid LOGSHIP_LOG_LEVEL {log_level:?} ({e}), falling back to {DEFAULT_LOG_LEVEL}");
        EnvFilter::new(DEFAULT_LOG_LEVEL)
    });

    // stdout is left to the data; diagnostics go to stderr.
    // try_init also routes `log` records from dependencies into tracing.
    if let Err(e) = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(Formatter::default())
        .try_init()
    {
        eprintln!("Failed to install log subscriber: {e}");
        return ExitCode::FAILURE;
    }

    debug!("Logging subsystem enabled");

    let config = match SenderConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let sender = match Sender::new(config) {
        Ok(sender) => sender,
        Err(e) => {
            error!("Error starting sender: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut shipped = 0u64;
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    error!("Failed to listen for shutdown signal: {e}");
                }
                info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let admission = sender.send(line);
                    if admission.is_queued() {
                        shipped += 1;
                    } else {
                        debug!("Line dropped: {admission:?}");
                    }
                }
                Ok(None) => {
                    debug!("Reached end of input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read from stdin: {e}");
                    break;
                }
            }
        }
    }

    info!("Queued {shipped} lines, flushing before exit");
    sender.stop().await;
    ExitCode::SUCCESS
}
