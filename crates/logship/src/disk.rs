// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Disk-space guard for the durable queue.
//!
//! [`DiskMonitor`] periodically measures the filesystem holding the queue
//! directory with `statfs(2)` and flips a shared flag that the intake reads
//! before admitting records. On Windows the probe always fails, so the flag
//! never leaves its initial `false`.

use crate::config::DiskThreshold;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Space accounting for one filesystem, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total: u64,
    /// Available to unprivileged users.
    pub available: u64,
    pub used: u64,
}

impl DiskUsage {
    /// Share of the user-visible space that is used, `0.0..=100.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn used_percent(&self) -> f64 {
        let visible = self.used.saturating_add(self.available);
        if visible == 0 {
            return 0.0;
        }
        self.used as f64 / visible as f64 * 100.0
    }
}

/// Measures the filesystem containing `path`.
#[cfg(not(target_os = "windows"))]
#[allow(clippy::cast_lossless, clippy::unnecessary_cast)]
pub fn disk_usage(path: &Path) -> Result<DiskUsage, io::Error> {
    let stat = nix::sys::statfs::statfs(path).map_err(io::Error::from)?;

    let block_size = stat.block_size() as u64;
    let blocks = stat.blocks() as u64;
    let free = stat.blocks_free() as u64;
    let available = stat.blocks_available() as u64;

    Ok(DiskUsage {
        total: blocks.saturating_mul(block_size),
        available: available.saturating_mul(block_size),
        used: blocks.saturating_sub(free).saturating_mul(block_size),
    })
}

#[cfg(target_os = "windows")]
pub fn disk_usage(_path: &Path) -> Result<DiskUsage, io::Error> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Cannot measure disk usage on Windows",
    ))
}

impl DiskThreshold {
    #[must_use]
    pub fn is_exceeded(&self, usage: &DiskUsage) -> bool {
        match *self {
            DiskThreshold::MinFreeBytes(min_free) => usage.available < min_free,
            DiskThreshold::MaxUsedPercent(max_used) => usage.used_percent() > max_used,
        }
    }
}

#[derive(Debug)]
pub struct DiskMonitor {
    dir: PathBuf,
    threshold: DiskThreshold,
    interval: Duration,
    disk_full: Arc<AtomicBool>,
}

impl DiskMonitor {
    pub fn new(
        dir: impl Into<PathBuf>,
        threshold: DiskThreshold,
        interval: Duration,
        disk_full: Arc<AtomicBool>,
    ) -> Self {
        DiskMonitor {
            dir: dir.into(),
            threshold,
            interval,
            disk_full,
        }
    }

    /// Measures once and updates the flag. Returns the flag value after the
    /// check; a failed measurement leaves it as it was.
    pub fn check(&self) -> bool {
        let usage = match disk_usage(&self.dir) {
            Ok(usage) => usage,
            Err(e) => {
                warn!(
                    "Failed to measure disk usage at {}: {e}",
                    self.dir.display()
                );
                return self.disk_full.load(Ordering::Relaxed);
            }
        };

        let full = self.threshold.is_exceeded(&usage);
        let was_full = self.disk_full.swap(full, Ordering::Relaxed);
        match (was_full, full) {
            (false, true) => warn!(
                "Disk at {} crossed {:?} ({} bytes available, {:.1}% used), dropping new records",
                self.dir.display(),
                self.threshold,
                usage.available,
                usage.used_percent()
            ),
            (true, false) => info!(
                "Disk at {} is below {:?} again, accepting records",
                self.dir.display(),
                self.threshold
            ),
            _ => {}
        }
        full
    }

    /// Checks right away, then once per interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        if self.interval.is_zero() {
            debug!("Disk space check disabled: zero interval");
            return;
        }

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("Disk monitor for {} stopped", self.dir.display());
                    return;
                }
                _ = interval.tick() => {
                    self.check();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn usage(used: u64, available: u64) -> DiskUsage {
        DiskUsage {
            total: used + available,
            available,
            used,
        }
    }

    #[test]
    fn test_used_percent() {
        assert!((usage(GIB, 3 * GIB).used_percent() - 25.0).abs() < f64::EPSILON);
        assert!(usage(0, 0).used_percent().abs() < f64::EPSILON);
    }

    #[test]
    fn test_max_used_percent_threshold() {
        let threshold = DiskThreshold::MaxUsedPercent(70.0);
        assert!(!threshold.is_exceeded(&usage(7 * GIB, 3 * GIB)));
        assert!(threshold.is_exceeded(&usage(8 * GIB, 2 * GIB)));
    }

    #[test]
    fn test_min_free_bytes_threshold() {
        let threshold = DiskThreshold::MinFreeBytes(GIB);
        assert!(!threshold.is_exceeded(&usage(GIB, GIB)));
        assert!(threshold.is_exceeded(&usage(GIB, GIB - 1)));
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn test_disk_usage_of_temp_dir() {
        let tmp = TempDir::new().unwrap();
        let usage = disk_usage(tmp.path()).unwrap();
        assert!(usage.total > 0);
        assert!(usage.used <= usage.total);
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn test_check_flips_flag_both_ways() {
        let tmp = TempDir::new().unwrap();
        let flag = Arc::new(AtomicBool::new(false));

        let unreachable = DiskMonitor::new(
            tmp.path(),
            DiskThreshold::MinFreeBytes(u64::MAX),
            Duration::from_secs(1),
            Arc::clone(&flag),
        );
        assert!(unreachable.check());
        assert!(flag.load(Ordering::Relaxed));

        let trivial = DiskMonitor::new(
            tmp.path(),
            DiskThreshold::MinFreeBytes(0),
            Duration::from_secs(1),
            Arc::clone(&flag),
        );
        assert!(!trivial.check());
        assert!(!flag.load(Ordering::Relaxed));
    }

    #[test]
    fn test_measurement_failure_keeps_flag() {
        let tmp = TempDir::new().unwrap();
        let flag = Arc::new(AtomicBool::new(true));
        let monitor = DiskMonitor::new(
            tmp.path().join("does/not/exist"),
            DiskThreshold::MinFreeBytes(0),
            Duration::from_secs(1),
            Arc::clone(&flag),
        );
        assert!(monitor.check());
        assert!(flag.load(Ordering::Relaxed));
    }

    #[cfg(not(target_os = "windows"))]
    #[tokio::test]
    async fn test_run_checks_immediately_and_stops_on_cancel() {
        let tmp = TempDir::new().unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let monitor = DiskMonitor::new(
            tmp.path(),
            DiskThreshold::MinFreeBytes(u64::MAX),
            Duration::from_secs(3600),
            Arc::clone(&flag),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor.run(cancel.clone()));

        for _ in 0..100 {
            if flag.load(Ordering::Relaxed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(flag.load(Ordering::Relaxed));

        cancel.cancel();
        task.await.unwrap();
    }
}
