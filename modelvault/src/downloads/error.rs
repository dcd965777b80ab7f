//! Error types for the download pipeline.

use std::path::PathBuf;

use thiserror::Error;

use super::task::TaskId;

/// Errors raised while fetching and verifying a single file.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error fetching {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("server returned status {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("no data received for {url} within {timeout_secs}s")]
    IdleTimeout { url: String, timeout_secs: u64 },

    #[error("disk error at {path}: {source}")]
    Disk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Whether this error was a cooperative cancellation rather than a
    /// real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors raised by the task manager's control operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The resource never resolved to a downloadable artifact.
    #[error("resource '{name}' is not resolved to a downloadable file")]
    Unresolved { name: String },

    /// The target file already exists on disk.
    #[error("file already exists at {path}")]
    AlreadyDownloaded { path: PathBuf },

    /// Another live task is already writing the same target path. The
    /// caller should adopt the existing task instead of submitting.
    #[error("a download for this target is already in flight (task {task_id})")]
    DuplicateInFlight { task_id: TaskId },

    /// No task with this id is known (it may have aged out of history).
    #[error("unknown task {task_id}")]
    NotFound { task_id: TaskId },

    /// Retry was requested for a task that is not in a retryable state.
    #[error("task {task_id} is {status} and cannot be retried")]
    NotRetryable { task_id: TaskId, status: String },

    /// Umbrella batch tasks cannot be retried directly.
    #[error("task {task_id} is a batch task; retry its children instead")]
    BatchNotRetryable { task_id: TaskId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_detection() {
        assert!(DownloadError::Cancelled.is_cancelled());
        assert!(!DownloadError::Network {
            url: "http://x".to_string(),
            reason: "reset".to_string(),
        }
        .is_cancelled());
    }

    #[test]
    fn test_error_display() {
        let err = ManagerError::DuplicateInFlight { task_id: TaskId(7) };
        assert!(err.to_string().contains("task 7"));

        let err = DownloadError::IdleTimeout {
            url: "http://x/file".to_string(),
            timeout_secs: 60,
        };
        assert!(err.to_string().contains("60s"));
    }
}
