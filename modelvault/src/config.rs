//! Configuration for the download orchestrator.
//!
//! This module defines `DownloadConfig`, the tuning surface shared by the
//! task manager, downloader, and verifier. All values have conservative
//! defaults; callers override individual knobs with the `with_*` builders.

use std::time::Duration;

/// Default number of downloads running at once.
///
/// Model files are large and most registries throttle per-connection
/// bandwidth, so a small pool keeps aggregate throughput high without
/// saturating the link.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Default idle timeout for a download stream.
///
/// If no bytes arrive for this long the transfer is treated as a network
/// error rather than a hang. There is deliberately no cap on total
/// duration given multi-gigabyte model files.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

/// Default number of terminal tasks retained for late status polls.
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

/// Minimum bytes between two progress events for the same task.
pub const DEFAULT_PROGRESS_BYTE_INTERVAL: u64 = 256 * 1024;

/// Minimum time between two progress events for the same task.
pub const DEFAULT_PROGRESS_TIME_INTERVAL: Duration = Duration::from_millis(250);

/// Tuning knobs for the download task manager and its workers.
#[derive(Clone, Debug)]
pub struct DownloadConfig {
    /// Maximum number of tasks in the `Downloading`/`Verifying` stages
    /// at once. Tasks beyond the cap queue in FIFO order.
    pub concurrency: usize,

    /// Treat a stream with no bytes for this long as a network error.
    pub idle_timeout: Duration,

    /// Terminal tasks kept in the history map before pruning.
    pub history_limit: usize,

    /// Byte delta that forces a progress event.
    pub progress_byte_interval: u64,

    /// Time delta that forces a progress event.
    pub progress_time_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            history_limit: DEFAULT_HISTORY_LIMIT,
            progress_byte_interval: DEFAULT_PROGRESS_BYTE_INTERVAL,
            progress_time_interval: DEFAULT_PROGRESS_TIME_INTERVAL,
        }
    }
}

impl DownloadConfig {
    /// Set the worker pool size. A value of zero is clamped to one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the idle timeout for download streams.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the number of terminal tasks kept for late status polls.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }
}
