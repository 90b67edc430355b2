// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::{
    DEFAULT_BUFFER_DIR_NAME, DEFAULT_DISK_CHECK_INTERVAL, DEFAULT_DISK_USED_PERCENT_THRESHOLD,
    DEFAULT_DRAIN_INTERVAL, DEFAULT_IN_MEMORY_CAPACITY, DEFAULT_LISTENER_URL,
    DEFAULT_TRANSPORT_TIMEOUT,
};
use crate::errors::SenderError;
use std::env;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Which queue backend buffers records between drains.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueBackend {
    /// Volatile queue bounded by `capacity` bytes. Lost on crash.
    InMemory { capacity: u64 },
    /// Segmented on-disk queue rooted at `dir`, recovered on restart.
    Durable { dir: PathBuf, sync_writes: bool },
}

impl QueueBackend {
    /// Durable backend in a fresh, timestamped directory under the system temp dir.
    #[must_use]
    pub fn default_durable() -> Self {
        QueueBackend::Durable {
            dir: default_buffer_dir(),
            sync_writes: false,
        }
    }

    #[must_use]
    pub fn is_durable(&self) -> bool {
        matches!(self, QueueBackend::Durable { .. })
    }
}

/// When the disk holding the durable queue counts as full.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiskThreshold {
    /// Full when fewer than this many bytes are available.
    MinFreeBytes(u64),
    /// Full when more than this percentage of the filesystem is used.
    MaxUsedPercent(f64),
}

/// Configuration for a [`Sender`](crate::sender::Sender).
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Account token, sent as the `token` query parameter
    pub token: String,
    /// Collector base URL
    pub url: String,
    /// Period of the background drain timer
    pub drain_interval: Duration,
    pub backend: QueueBackend,
    /// Whether the disk-space guard runs (durable backend only)
    pub check_disk_space: bool,
    pub disk_threshold: DiskThreshold,
    pub disk_check_interval: Duration,
    /// Per-request transport timeout
    pub timeout: Duration,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            url: DEFAULT_LISTENER_URL.to_string(),
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            backend: QueueBackend::default_durable(),
            check_disk_space: true,
            disk_threshold: DiskThreshold::MaxUsedPercent(DEFAULT_DISK_USED_PERCENT_THRESHOLD),
            disk_check_interval: DEFAULT_DISK_CHECK_INTERVAL,
            timeout: DEFAULT_TRANSPORT_TIMEOUT,
            https_proxy: None,
        }
    }
}

impl SenderConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, SenderError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup, falling back to
    /// defaults for missing or unparsable values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SenderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|val| val.trim().parse::<u64>().ok())
                .map_or(default, Duration::from_secs)
        };
        let flag = |key: &str, default: bool| {
            lookup(key).map_or(default, |val| parse_bool(&val).unwrap_or(default))
        };

        let backend = if flag("LOGSHIP_IN_MEMORY", false) {
            let capacity = lookup("LOGSHIP_IN_MEMORY_CAPACITY")
                .and_then(|val| val.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_IN_MEMORY_CAPACITY);
            QueueBackend::InMemory { capacity }
        } else {
            let dir = match lookup("LOGSHIP_BUFFER_DIR") {
                Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
                _ => default_buffer_dir(),
            };
            QueueBackend::Durable {
                dir,
                sync_writes: flag("LOGSHIP_SYNC_WRITES", false),
            }
        };

        let disk_threshold = match lookup("LOGSHIP_DISK_MIN_FREE_BYTES")
            .and_then(|val| val.trim().parse::<u64>().ok())
        {
            Some(bytes) => DiskThreshold::MinFreeBytes(bytes),
            None => lookup("LOGSHIP_DISK_THRESHOLD")
                .and_then(|val| val.trim().parse::<f64>().ok())
                .map_or(defaults.disk_threshold, DiskThreshold::MaxUsedPercent),
        };

        let config = Self {
            token: lookup("LOGSHIP_TOKEN").unwrap_or_default(),
            url: lookup("LOGSHIP_URL")
                .filter(|url| !url.trim().is_empty())
                .unwrap_or(defaults.url),
            drain_interval: secs("LOGSHIP_DRAIN_INTERVAL_SECS", defaults.drain_interval),
            backend,
            check_disk_space: flag("LOGSHIP_CHECK_DISK_SPACE", defaults.check_disk_space),
            disk_threshold,
            disk_check_interval: secs(
                "LOGSHIP_DISK_CHECK_INTERVAL_SECS",
                defaults.disk_check_interval,
            ),
            timeout: secs("LOGSHIP_TIMEOUT_SECS", defaults.timeout),
            https_proxy: lookup("LOGSHIP_PROXY_HTTPS").or_else(|| lookup("HTTPS_PROXY")),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), SenderError> {
        if let Err(e) = reqwest::Url::parse(&self.url) {
            return Err(SenderError::InvalidConfig(format!(
                "Invalid collector URL '{}': {e}",
                self.url
            )));
        }

        if self.drain_interval.is_zero() {
            return Err(SenderError::InvalidConfig(
                "Drain interval must be greater than 0".to_string(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(SenderError::InvalidConfig(
                "Transport timeout must be greater than 0".to_string(),
            ));
        }

        if let QueueBackend::InMemory { capacity: 0 } = self.backend {
            return Err(SenderError::InvalidConfig(
                "In-memory queue capacity must be greater than 0".to_string(),
            ));
        }

        if let DiskThreshold::MaxUsedPercent(percent) = self.disk_threshold {
            if !(0.0..=100.0).contains(&percent) {
                return Err(SenderError::InvalidConfig(format!(
                    "Invalid disk threshold {percent}. Must be a percentage between 0 and 100"
                )));
            }
        }

        Ok(())
    }

    /// True when the disk-space monitor should be spawned for this configuration.
    #[must_use]
    pub fn disk_monitor_enabled(&self) -> bool {
        self.backend.is_durable() && self.check_disk_space && !self.disk_check_interval.is_zero()
    }
}

/// `<tmp>/logship-buffer/<unix-nanos>`, unique per process start.
fn default_buffer_dir() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    env::temp_dir()
        .join(DEFAULT_BUFFER_DIR_NAME)
        .join(nanos.to_string())
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
