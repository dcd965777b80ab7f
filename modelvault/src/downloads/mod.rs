//! Download orchestration: task manager, streaming downloader,
//! verification, and progress events.

mod downloader;
mod error;
mod events;
mod manager;
mod task;
mod verifier;

pub use downloader::Downloader;
pub use error::{DownloadError, ManagerError};
pub use events::{EventBroadcaster, EventSubscriber, TaskEvent, DEFAULT_QUEUE_CAPACITY};
pub use manager::{BatchSubmission, DownloadManager, SkippedResource};
pub use task::{DownloadTask, TaskId, TaskStatus};
pub use verifier::{HashAlgorithm, Verifier};
