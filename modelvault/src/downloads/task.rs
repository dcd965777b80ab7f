//! Task identity and lifecycle state.
//!
//! Every download (and every umbrella batch) is tracked as a task with a
//! process-unique id and a status that moves strictly forward to one of
//! the three terminal states. Snapshots of task state are cheap clones
//! handed out to the API layer and the CLI.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonic task id source. Process-unique, never reused.
static TASK_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Allocate the next task id.
    pub fn next() -> Self {
        Self(TASK_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a download task.
///
/// Transitions only move forward: `Idle` → `Waiting` → `Downloading` →
/// `Verifying` → `Completed`, with `Failed` and `Cancelled` reachable
/// from any non-terminal state. `Idle` exists only between construction
/// and enqueue and is never published. A retried task is reset to
/// `Waiting` under the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Waiting,
    Downloading,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states accept no further transitions (except retry).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: TaskId,
    /// Display name of the resource being fetched.
    pub resource_name: String,
    /// Source URL. Absent on umbrella batch tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Final destination. Absent on umbrella batch tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_path: Option<PathBuf>,
    pub status: TaskStatus,
    pub bytes_downloaded: u64,
    /// Expected total bytes, 0 when unknown.
    pub total_bytes: u64,
    /// Download attempts under this id, reset to zero by retry.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Child task ids. Non-empty only for umbrella batch tasks.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub children: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadTask {
    /// Whether this snapshot describes an umbrella batch task.
    pub fn is_batch(&self) -> bool {
        !self.children.is_empty()
    }

    /// Progress percentage, clamped to 0..=100. Unknown totals report 0
    /// until completion, then 100.
    pub fn progress_pct(&self) -> f64 {
        if self.status == TaskStatus::Completed {
            return 100.0;
        }
        if self.total_bytes == 0 {
            return 0.0;
        }
        ((self.bytes_downloaded as f64 / self.total_bytes as f64) * 100.0).min(100.0)
    }
}
