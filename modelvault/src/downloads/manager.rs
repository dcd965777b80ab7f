//! Download task manager.
//!
//! Owns the task table, enforces single-flight per target path and the
//! global concurrency cap, and drives each task through its lifecycle
//! on a spawned runner. Admission is FIFO through a fair semaphore:
//! tasks past the cap stay `Waiting` in submission order. Terminal
//! tasks are kept in a bounded history for inspection and retry.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DownloadConfig;
use crate::resolver::Resource;

use super::downloader::Downloader;
use super::error::{DownloadError, ManagerError};
use super::events::{EventBroadcaster, EventSubscriber, TaskEvent};
use super::task::{DownloadTask, TaskId, TaskStatus};
use super::verifier::Verifier;

/// Suffix appended to the destination path for in-progress files.
const TEMP_SUFFIX: &str = ".part";

/// Temp file path for a destination: same directory, `.part` suffix.
fn temp_path(target: &Path) -> PathBuf {
    let mut os = target.as_os_str().to_os_string();
    os.push(TEMP_SUFFIX);
    PathBuf::from(os)
}

struct TaskState {
    status: TaskStatus,
    bytes_downloaded: u64,
    total_bytes: u64,
    attempts: u32,
    error: Option<String>,
    updated_at: DateTime<Utc>,
}

struct TaskHandle {
    id: TaskId,
    resource_name: String,
    url: Option<String>,
    target_path: Option<PathBuf>,
    sha256: Option<String>,
    size_hint: u64,
    children: Vec<TaskId>,
    state: Mutex<TaskState>,
    status_tx: watch::Sender<TaskStatus>,
    /// Replaced with a fresh token on retry.
    cancel: Mutex<CancellationToken>,
    created_at: DateTime<Utc>,
}

impl TaskHandle {
    fn new(
        id: TaskId,
        resource_name: String,
        url: Option<String>,
        target_path: Option<PathBuf>,
        sha256: Option<String>,
        size_hint: u64,
        children: Vec<TaskId>,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(TaskStatus::Idle);
        Arc::new(Self {
            id,
            resource_name,
            url,
            target_path,
            sha256,
            size_hint,
            children,
            state: Mutex::new(TaskState {
                status: TaskStatus::Idle,
                bytes_downloaded: 0,
                total_bytes: size_hint,
                attempts: 0,
                error: None,
                updated_at: Utc::now(),
            }),
            status_tx,
            cancel: Mutex::new(CancellationToken::new()),
            created_at: Utc::now(),
        })
    }

    fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    /// Move a freshly constructed task from `Idle` to `Waiting`.
    fn enqueue(&self) {
        {
            let mut state = self.state.lock();
            state.status = TaskStatus::Waiting;
            state.updated_at = Utc::now();
        }
        self.status_tx.send_replace(TaskStatus::Waiting);
    }

    fn snapshot(&self) -> DownloadTask {
        let state = self.state.lock();
        DownloadTask {
            id: self.id,
            resource_name: self.resource_name.clone(),
            url: self.url.clone(),
            target_path: self.target_path.clone(),
            status: state.status,
            bytes_downloaded: state.bytes_downloaded,
            total_bytes: state.total_bytes,
            attempts: state.attempts,
            error: state.error.clone(),
            children: self.children.clone(),
            created_at: self.created_at,
            updated_at: state.updated_at,
        }
    }

    fn event(&self) -> TaskEvent {
        let snapshot = self.snapshot();
        TaskEvent {
            task_id: snapshot.id,
            resource_name: snapshot.resource_name.clone(),
            status: snapshot.status,
            bytes_downloaded: snapshot.bytes_downloaded,
            total_bytes: snapshot.total_bytes,
            progress_pct: snapshot.progress_pct(),
            error: snapshot.error.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Per-resource outcome of a batch submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedResource {
    pub name: String,
    pub reason: String,
}

/// Result of submitting a batch of resources under an umbrella task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSubmission {
    pub batch_id: TaskId,
    pub children: Vec<TaskId>,
    pub skipped: Vec<SkippedResource>,
}

struct Inner {
    config: DownloadConfig,
    downloader: Downloader,
    verifier: Verifier,
    broadcaster: EventBroadcaster,
    semaphore: Arc<Semaphore>,
    api_key: Option<String>,
    tasks: RwLock<HashMap<TaskId, Arc<TaskHandle>>>,
    /// Insertion order, used for history pruning and listing.
    order: Mutex<VecDeque<TaskId>>,
    /// Live (non-terminal) task per destination path.
    in_flight: Mutex<HashMap<PathBuf, TaskId>>,
}

/// Handle to the download orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn new(config: DownloadConfig) -> Result<Self, DownloadError> {
        Self::with_verifier(config, Verifier::default(), None)
    }

    pub fn with_verifier(
        config: DownloadConfig,
        verifier: Verifier,
        api_key: Option<String>,
    ) -> Result<Self, DownloadError> {
        let downloader = Downloader::new(&config)?;
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                downloader,
                verifier,
                broadcaster: EventBroadcaster::default(),
                semaphore,
                api_key,
                tasks: RwLock::new(HashMap::new()),
                order: Mutex::new(VecDeque::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Subscribe to the progress event stream.
    pub fn subscribe(&self) -> EventSubscriber {
        self.inner.broadcaster.subscribe()
    }

    /// Submit a single resolved resource for download.
    ///
    /// Returns immediately with the new task id; the download runs on a
    /// spawned runner. Exactly one live task may exist per destination
    /// path.
    pub fn submit(&self, resource: &Resource) -> Result<TaskId, ManagerError> {
        let (url, target_path) = match (&resource.download_url, &resource.target_path) {
            (Some(url), Some(path)) if resource.resolved => (url.clone(), path.clone()),
            _ => {
                return Err(ManagerError::Unresolved {
                    name: resource.name.clone(),
                })
            }
        };

        if resource.already_downloaded || target_path.exists() {
            return Err(ManagerError::AlreadyDownloaded { path: target_path });
        }

        let id = TaskId::next();
        {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(&existing) = in_flight.get(&target_path) {
                return Err(ManagerError::DuplicateInFlight { task_id: existing });
            }
            in_flight.insert(target_path.clone(), id);
        }

        let handle = TaskHandle::new(
            id,
            resource.name.clone(),
            Some(url),
            Some(target_path),
            resource.sha256.clone(),
            resource.size_bytes().unwrap_or(0),
            Vec::new(),
        );
        self.register(Arc::clone(&handle));
        handle.enqueue();

        info!(task_id = %id, resource = %handle.resource_name, "download task submitted");
        self.inner.broadcaster.publish(handle.event());
        self.spawn_runner(handle);
        Ok(id)
    }

    /// Submit every resource that needs a download under one umbrella
    /// task.
    ///
    /// Already-downloaded, unresolved, and duplicate-in-flight resources
    /// are skipped with a reason rather than failing the batch. The
    /// umbrella reaches a terminal state once every child has; cancelling
    /// it cancels only the children it spawned here.
    pub fn submit_batch(&self, resources: &[Resource]) -> BatchSubmission {
        let mut children = Vec::new();
        let mut skipped = Vec::new();

        for resource in resources {
            if !resource.needs_download() {
                let reason = if resource.already_downloaded {
                    "already downloaded".to_string()
                } else {
                    resource
                        .error
                        .clone()
                        .unwrap_or_else(|| "not resolved".to_string())
                };
                skipped.push(SkippedResource {
                    name: resource.name.clone(),
                    reason,
                });
                continue;
            }
            match self.submit(resource) {
                Ok(id) => children.push(id),
                Err(e) => skipped.push(SkippedResource {
                    name: resource.name.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        let batch_id = TaskId::next();
        let total_hint: u64 = {
            let tasks = self.inner.tasks.read();
            children
                .iter()
                .filter_map(|id| tasks.get(id))
                .map(|h| h.size_hint)
                .sum()
        };
        let handle = TaskHandle::new(
            batch_id,
            format!("batch of {}", children.len()),
            None,
            None,
            None,
            total_hint,
            children.clone(),
        );
        self.register(Arc::clone(&handle));
        handle.enqueue();

        if children.is_empty() {
            // Nothing to wait for.
            self.inner.finish(&handle, TaskStatus::Completed, None);
        } else {
            self.inner.broadcaster.publish(handle.event());
            self.spawn_aggregator(handle);
        }

        info!(
            batch_id = %batch_id,
            children = children.len(),
            skipped = skipped.len(),
            "batch submitted"
        );
        BatchSubmission {
            batch_id,
            children,
            skipped,
        }
    }

    /// Request cancellation of a task. Idempotent; cancelling a terminal
    /// task is a no-op. Cancelling an umbrella task also cancels the
    /// children it spawned.
    pub fn cancel(&self, id: TaskId) -> Result<TaskStatus, ManagerError> {
        let handle = self
            .inner
            .tasks
            .read()
            .get(&id)
            .cloned()
            .ok_or(ManagerError::NotFound { task_id: id })?;

        handle.cancel.lock().cancel();
        debug!(task_id = %id, "cancellation requested");

        let children: Vec<Arc<TaskHandle>> = {
            let tasks = self.inner.tasks.read();
            handle
                .children
                .iter()
                .filter_map(|child| tasks.get(child).cloned())
                .collect()
        };
        for child in children {
            child.cancel.lock().cancel();
        }
        Ok(handle.status())
    }

    /// Cancel every non-terminal task. Returns the number of tasks the
    /// request reached.
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<Arc<TaskHandle>> = self.inner.tasks.read().values().cloned().collect();
        let mut count = 0;
        for handle in handles {
            if !handle.status().is_terminal() {
                handle.cancel.lock().cancel();
                count += 1;
            }
        }
        info!(count, "cancel-all requested");
        count
    }

    /// Restart a failed or cancelled task under its original id.
    ///
    /// Counters are reset and a fresh download begins, subject to the
    /// same single-flight and concurrency rules as a new submission.
    pub fn retry(&self, id: TaskId) -> Result<TaskId, ManagerError> {
        let handle = self
            .inner
            .tasks
            .read()
            .get(&id)
            .cloned()
            .ok_or(ManagerError::NotFound { task_id: id })?;

        if !handle.children.is_empty() {
            return Err(ManagerError::BatchNotRetryable { task_id: id });
        }
        let status = handle.status();
        if !matches!(status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(ManagerError::NotRetryable {
                task_id: id,
                status: status.to_string(),
            });
        }
        let target_path = handle
            .target_path
            .clone()
            .ok_or(ManagerError::NotRetryable {
                task_id: id,
                status: status.to_string(),
            })?;
        if target_path.exists() {
            return Err(ManagerError::AlreadyDownloaded { path: target_path });
        }

        {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(&existing) = in_flight.get(&target_path) {
                return Err(ManagerError::DuplicateInFlight { task_id: existing });
            }
            in_flight.insert(target_path, id);
        }

        {
            let mut state = handle.state.lock();
            state.status = TaskStatus::Waiting;
            state.bytes_downloaded = 0;
            state.total_bytes = handle.size_hint;
            state.attempts = 0;
            state.error = None;
            state.updated_at = Utc::now();
        }
        *handle.cancel.lock() = CancellationToken::new();
        handle.status_tx.send_replace(TaskStatus::Waiting);

        info!(task_id = %id, "task retried");
        self.inner.broadcaster.publish(handle.event());
        self.spawn_runner(handle);
        Ok(id)
    }

    /// Drop every terminal task from the table. Live tasks stay.
    /// Returns the number of tasks removed.
    pub fn clear_history(&self) -> usize {
        let mut order = self.inner.order.lock();
        let mut tasks = self.inner.tasks.write();
        let before = order.len();
        order.retain(|id| tasks.get(id).map_or(false, |h| !h.status().is_terminal()));
        tasks.retain(|_, h| !h.status().is_terminal());
        before - order.len()
    }

    /// Snapshot of one task.
    pub fn task(&self, id: TaskId) -> Option<DownloadTask> {
        self.inner.tasks.read().get(&id).map(|h| h.snapshot())
    }

    /// Snapshots of all known tasks in submission order.
    pub fn tasks(&self) -> Vec<DownloadTask> {
        let order = self.inner.order.lock().clone();
        let tasks = self.inner.tasks.read();
        order
            .iter()
            .filter_map(|id| tasks.get(id))
            .map(|h| h.snapshot())
            .collect()
    }

    /// Wait until the task reaches a terminal state and return it.
    pub async fn wait(&self, id: TaskId) -> Option<TaskStatus> {
        let handle = self.inner.tasks.read().get(&id).cloned()?;
        let mut rx = handle.status_tx.subscribe();
        loop {
            let status = *rx.borrow();
            if status.is_terminal() {
                return Some(status);
            }
            if rx.changed().await.is_err() {
                return Some(handle.status());
            }
        }
    }

    fn register(&self, handle: Arc<TaskHandle>) {
        let id = handle.id;
        self.inner.tasks.write().insert(id, handle);
        let mut order = self.inner.order.lock();
        order.push_back(id);
        self.prune_history(&mut order);
    }

    /// Evict the oldest terminal tasks above the history limit.
    /// Non-terminal tasks are never evicted.
    fn prune_history(&self, order: &mut VecDeque<TaskId>) {
        while order.len() > self.inner.config.history_limit {
            let Some(idx) = order.iter().position(|id| {
                self.inner
                    .tasks
                    .read()
                    .get(id)
                    .map_or(true, |h| h.status().is_terminal())
            }) else {
                break;
            };
            if let Some(id) = order.remove(idx) {
                self.inner.tasks.write().remove(&id);
                debug!(task_id = %id, "task evicted from history");
            }
        }
    }

    fn spawn_runner(&self, handle: Arc<TaskHandle>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_task(handle).await;
        });
    }

    fn spawn_aggregator(&self, handle: Arc<TaskHandle>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_batch(handle).await;
        });
    }
}

impl Inner {
    /// Drive a leaf task from admission through verification.
    async fn run_task(self: Arc<Self>, handle: Arc<TaskHandle>) {
        let cancel = handle.cancel.lock().clone();

        // FIFO admission under the concurrency cap. The task stays
        // Waiting here; cancellation while queued produces no temp file.
        let _permit = tokio::select! {
            _ = cancel.cancelled() => {
                self.finish(&handle, TaskStatus::Cancelled, None);
                return;
            }
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.finish(&handle, TaskStatus::Failed, Some("scheduler shut down".to_string()));
                    return;
                }
            },
        };

        let (Some(url), Some(target_path)) = (handle.url.clone(), handle.target_path.clone())
        else {
            self.finish(&handle, TaskStatus::Failed, Some("task has no download target".to_string()));
            return;
        };

        {
            let mut state = handle.state.lock();
            state.status = TaskStatus::Downloading;
            state.attempts += 1;
            state.updated_at = Utc::now();
        }
        handle.status_tx.send_replace(TaskStatus::Downloading);
        self.broadcaster.publish(handle.event());

        let temp = temp_path(&target_path);
        let size_hint = handle.size_hint;
        let progress_handle = Arc::clone(&handle);
        let result = self
            .downloader
            .fetch(&url, &temp, self.api_key.as_deref(), &cancel, |done, total| {
                let total = if total == 0 { size_hint } else { total };
                {
                    let mut state = progress_handle.state.lock();
                    state.bytes_downloaded = done;
                    state.total_bytes = total;
                    state.updated_at = Utc::now();
                }
                self.broadcaster.publish(progress_handle.event());
            })
            .await;

        match result {
            Err(e) if e.is_cancelled() => {
                self.finish(&handle, TaskStatus::Cancelled, None);
            }
            Err(e) => {
                warn!(task_id = %handle.id, error = %e, "download failed");
                self.finish(&handle, TaskStatus::Failed, Some(e.to_string()));
            }
            Ok(_) => {
                {
                    let mut state = handle.state.lock();
                    state.status = TaskStatus::Verifying;
                    state.updated_at = Utc::now();
                }
                handle.status_tx.send_replace(TaskStatus::Verifying);
                self.broadcaster.publish(handle.event());

                // The verifier observes cancellation between hash chunks;
                // once the rename commits a racing cancel is a no-op.
                match self
                    .verifier
                    .verify_and_promote(&temp, &target_path, handle.sha256.as_deref(), &cancel)
                    .await
                {
                    Ok(()) => {
                        info!(task_id = %handle.id, path = %target_path.display(), "download completed");
                        self.finish(&handle, TaskStatus::Completed, None);
                    }
                    Err(e) if e.is_cancelled() => {
                        self.finish(&handle, TaskStatus::Cancelled, None);
                    }
                    Err(e) => {
                        warn!(task_id = %handle.id, error = %e, "verification failed");
                        self.finish(&handle, TaskStatus::Failed, Some(e.to_string()));
                    }
                }
            }
        }
    }

    /// Wait for every child of an umbrella task and aggregate.
    async fn run_batch(self: Arc<Self>, handle: Arc<TaskHandle>) {
        {
            let mut state = handle.state.lock();
            state.status = TaskStatus::Downloading;
            state.updated_at = Utc::now();
        }
        handle.status_tx.send_replace(TaskStatus::Downloading);

        let children: Vec<Arc<TaskHandle>> = {
            let tasks = self.tasks.read();
            handle
                .children
                .iter()
                .filter_map(|id| tasks.get(id).cloned())
                .collect()
        };

        // Child progress lands on the child handles only; a ticker folds
        // it into the umbrella's counters while children are live so
        // snapshots and events on the batch id track the real sum.
        let mut ticker = tokio::time::interval(self.config.progress_time_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut statuses = Vec::with_capacity(children.len());
        for child in &children {
            let mut rx = child.status_tx.subscribe();
            loop {
                let status = *rx.borrow();
                if status.is_terminal() {
                    statuses.push(status);
                    break;
                }
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            statuses.push(child.status());
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.refresh_batch_progress(&handle, &children);
                    }
                }
            }
        }

        self.refresh_batch_progress(&handle, &children);

        let cancel_requested = handle.cancel.lock().is_cancelled();
        let (status, error) = if statuses.iter().any(|s| *s == TaskStatus::Failed) {
            let failed = statuses.iter().filter(|s| **s == TaskStatus::Failed).count();
            (
                TaskStatus::Failed,
                Some(format!("{failed} of {} downloads failed", statuses.len())),
            )
        } else if cancel_requested || statuses.iter().any(|s| *s == TaskStatus::Cancelled) {
            (TaskStatus::Cancelled, None)
        } else {
            (TaskStatus::Completed, None)
        };

        info!(batch_id = %handle.id, status = %status, "batch finished");
        self.finish(&handle, status, error);
    }

    /// Fold child byte counters into the umbrella and publish a progress
    /// event when the sum moved.
    fn refresh_batch_progress(&self, handle: &Arc<TaskHandle>, children: &[Arc<TaskHandle>]) {
        let (done, total) = children.iter().fold((0u64, 0u64), |(done, total), child| {
            let state = child.state.lock();
            (done + state.bytes_downloaded, total + state.total_bytes)
        });

        let moved = {
            let mut state = handle.state.lock();
            if state.bytes_downloaded == done && state.total_bytes == total {
                false
            } else {
                state.bytes_downloaded = done;
                state.total_bytes = total;
                state.updated_at = Utc::now();
                true
            }
        };
        if moved {
            self.broadcaster.publish(handle.event());
        }
    }

    /// Record a terminal state, release single-flight, and publish the
    /// terminal event.
    fn finish(&self, handle: &Arc<TaskHandle>, status: TaskStatus, error: Option<String>) {
        {
            let mut state = handle.state.lock();
            state.status = status;
            state.error = error;
            state.updated_at = Utc::now();
        }
        handle.status_tx.send_replace(status);

        if let Some(target) = &handle.target_path {
            let mut in_flight = self.in_flight.lock();
            if in_flight.get(target) == Some(&handle.id) {
                in_flight.remove(target);
            }
        }

        self.broadcaster.publish(handle.event());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ModelKind;
    use axum::routing::get;
    use axum::Router;
    use sha2::{Digest, Sha256};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn sha256_hex(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    fn resource(name: &str, url: String, dir: &Path, filename: &str) -> Resource {
        let mut r = Resource::unresolved(name, ModelKind::Lora);
        r.resolved = true;
        r.download_url = Some(url);
        r.filename = Some(filename.to_string());
        r.target_path = Some(dir.join(filename));
        r
    }

    fn manager() -> DownloadManager {
        DownloadManager::new(DownloadConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_submit_downloads_and_promotes() {
        let body = b"model weights";
        let addr = serve(Router::new().route("/f", get(|| async { &b"model weights"[..] }))).await;
        let temp = TempDir::new().unwrap();

        let mut res = resource("m", format!("http://{addr}/f"), temp.path(), "m.safetensors");
        res.sha256 = Some(sha256_hex(body));

        let mgr = manager();
        let id = mgr.submit(&res).unwrap();
        assert_eq!(mgr.wait(id).await, Some(TaskStatus::Completed));

        let target = temp.path().join("m.safetensors");
        assert_eq!(std::fs::read(&target).unwrap(), body);
        assert!(!temp_path(&target).exists());
    }

    #[tokio::test]
    async fn test_bad_checksum_fails_and_never_promotes() {
        let addr = serve(Router::new().route("/f", get(|| async { "tampered" }))).await;
        let temp = TempDir::new().unwrap();

        let mut res = resource("m", format!("http://{addr}/f"), temp.path(), "m.safetensors");
        res.sha256 = Some(sha256_hex(b"original"));

        let mgr = manager();
        let id = mgr.submit(&res).unwrap();
        assert_eq!(mgr.wait(id).await, Some(TaskStatus::Failed));

        let target = temp.path().join("m.safetensors");
        assert!(!target.exists());
        assert!(!temp_path(&target).exists());
        let task = mgr.task(id).unwrap();
        assert!(task.error.unwrap().contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn test_duplicate_target_rejected_while_in_flight() {
        let addr = serve(Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                "data"
            }),
        ))
        .await;
        let temp = TempDir::new().unwrap();
        let res = resource("m", format!("http://{addr}/slow"), temp.path(), "m.bin");

        let mgr = manager();
        let first = mgr.submit(&res).unwrap();
        let err = mgr.submit(&res).unwrap_err();
        match err {
            ManagerError::DuplicateInFlight { task_id } => assert_eq!(task_id, first),
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(mgr.wait(first).await, Some(TaskStatus::Completed));
        // After completion the target exists, so a resubmit reports that
        // instead of a duplicate.
        assert!(matches!(
            mgr.submit(&res).unwrap_err(),
            ManagerError::AlreadyDownloaded { .. }
        ));
    }

    #[tokio::test]
    async fn test_unresolved_resource_rejected() {
        let mgr = manager();
        let res = Resource::unresolved("ghost", ModelKind::Lora);
        assert!(matches!(
            mgr.submit(&res).unwrap_err(),
            ManagerError::Unresolved { .. }
        ));
    }

    #[tokio::test]
    async fn test_cancel_leaves_no_partial_file() {
        let addr = serve(Router::new().route(
            "/hang",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        ))
        .await;
        let temp = TempDir::new().unwrap();
        let res = resource("m", format!("http://{addr}/hang"), temp.path(), "m.bin");

        let mgr = manager();
        let id = mgr.submit(&res).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        mgr.cancel(id).unwrap();
        assert_eq!(mgr.wait(id).await, Some(TaskStatus::Cancelled));

        let target = temp.path().join("m.bin");
        assert!(!target.exists());
        assert!(!temp_path(&target).exists());
    }

    #[tokio::test]
    async fn test_cancel_terminal_task_is_noop() {
        let addr = serve(Router::new().route("/f", get(|| async { "x" }))).await;
        let temp = TempDir::new().unwrap();
        let res = resource("m", format!("http://{addr}/f"), temp.path(), "m.bin");

        let mgr = manager();
        let id = mgr.submit(&res).unwrap();
        mgr.wait(id).await;
        assert_eq!(mgr.cancel(id).unwrap(), TaskStatus::Completed);
        assert_eq!(mgr.task(id).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_retry_reuses_id_and_resets_counters() {
        let temp = TempDir::new().unwrap();
        // Closed port: the first attempt fails fast.
        let res = resource("m", "http://127.0.0.1:9/f".to_string(), temp.path(), "m.bin");

        let mgr = manager();
        let id = mgr.submit(&res).unwrap();
        assert_eq!(mgr.wait(id).await, Some(TaskStatus::Failed));
        let failed = mgr.task(id).unwrap();
        assert_eq!(failed.attempts, 1);
        assert!(failed.error.is_some());

        let retried = mgr.retry(id).unwrap();
        assert_eq!(retried, id);
        assert_eq!(mgr.wait(id).await, Some(TaskStatus::Failed));
        // Counters were reset before the new attempt.
        assert_eq!(mgr.task(id).unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_rejected_for_running_or_completed() {
        let addr = serve(Router::new().route("/f", get(|| async { "x" }))).await;
        let temp = TempDir::new().unwrap();
        let res = resource("m", format!("http://{addr}/f"), temp.path(), "m.bin");

        let mgr = manager();
        let id = mgr.submit(&res).unwrap();
        mgr.wait(id).await;
        // Completed and the file exists.
        assert!(matches!(
            mgr.retry(id).unwrap_err(),
            ManagerError::NotRetryable { .. }
        ));
        assert!(matches!(
            mgr.retry(TaskId(u64::MAX)).unwrap_err(),
            ManagerError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_concurrency_cap_respected() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static ACTIVE: AtomicUsize = AtomicUsize::new(0);
        static PEAK: AtomicUsize = AtomicUsize::new(0);

        let addr = serve(Router::new().route(
            "/f",
            get(|| async {
                let now = ACTIVE.fetch_add(1, Ordering::SeqCst) + 1;
                PEAK.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                ACTIVE.fetch_sub(1, Ordering::SeqCst);
                "data"
            }),
        ))
        .await;
        let temp = TempDir::new().unwrap();

        let mgr = DownloadManager::new(DownloadConfig::default().with_concurrency(2)).unwrap();
        let ids: Vec<TaskId> = (0..6)
            .map(|i| {
                let res = resource(
                    &format!("m{i}"),
                    format!("http://{addr}/f"),
                    temp.path(),
                    &format!("m{i}.bin"),
                );
                mgr.submit(&res).unwrap()
            })
            .collect();

        for id in ids {
            assert_eq!(mgr.wait(id).await, Some(TaskStatus::Completed));
        }
        assert!(PEAK.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancel_all_reaches_every_live_task() {
        let addr = serve(Router::new().route(
            "/hang",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        ))
        .await;
        let temp = TempDir::new().unwrap();

        let mgr = manager();
        let ids: Vec<TaskId> = (0..5)
            .map(|i| {
                let res = resource(
                    &format!("m{i}"),
                    format!("http://{addr}/hang"),
                    temp.path(),
                    &format!("m{i}.bin"),
                );
                mgr.submit(&res).unwrap()
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mgr.cancel_all(), 5);
        for id in ids {
            assert_eq!(mgr.wait(id).await, Some(TaskStatus::Cancelled));
        }
        // No partial files remain.
        let leftovers: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_batch_umbrella_aggregates_children() {
        let addr = serve(Router::new().route("/f", get(|| async { "data" }))).await;
        let temp = TempDir::new().unwrap();

        let resources: Vec<Resource> = (0..3)
            .map(|i| {
                resource(
                    &format!("m{i}"),
                    format!("http://{addr}/f"),
                    temp.path(),
                    &format!("m{i}.bin"),
                )
            })
            .collect();

        let mgr = manager();
        let batch = mgr.submit_batch(&resources);
        assert_eq!(batch.children.len(), 3);
        assert!(batch.skipped.is_empty());
        assert_eq!(mgr.wait(batch.batch_id).await, Some(TaskStatus::Completed));

        let snapshot = mgr.task(batch.batch_id).unwrap();
        assert!(snapshot.is_batch());
        assert_eq!(snapshot.children, batch.children);
    }

    #[tokio::test]
    async fn test_batch_failed_child_fails_umbrella() {
        let addr = serve(Router::new().route("/f", get(|| async { "data" }))).await;
        let temp = TempDir::new().unwrap();
        let good = resource("good", format!("http://{addr}/f"), temp.path(), "good.bin");
        let bad = resource("bad", "http://127.0.0.1:9/f".to_string(), temp.path(), "bad.bin");

        let mgr = manager();
        let batch = mgr.submit_batch(&[good, bad]);
        assert_eq!(mgr.wait(batch.batch_id).await, Some(TaskStatus::Failed));
        let snapshot = mgr.task(batch.batch_id).unwrap();
        assert!(snapshot.error.unwrap().contains("1 of 2"));
    }

    #[tokio::test]
    async fn test_batch_skips_already_downloaded_and_unresolved() {
        let temp = TempDir::new().unwrap();
        let mut done = resource("done", "http://x/f".to_string(), temp.path(), "done.bin");
        done.already_downloaded = true;
        let ghost = Resource::unresolved("ghost", ModelKind::Lora);

        let mgr = manager();
        let batch = mgr.submit_batch(&[done, ghost]);
        assert!(batch.children.is_empty());
        assert_eq!(batch.skipped.len(), 2);
        // An empty batch completes immediately.
        assert_eq!(mgr.wait(batch.batch_id).await, Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_batch_reports_child_progress_before_terminal() {
        // First chunk lands immediately, then the body stalls so the
        // umbrella can be observed mid-flight.
        let addr = serve(Router::new().route(
            "/drip",
            get(|| async {
                let stream = futures::stream::unfold(0u32, |step| async move {
                    match step {
                        0 => Some((Ok::<Vec<u8>, std::io::Error>(vec![0u8; 64 * 1024]), 1)),
                        1 => {
                            tokio::time::sleep(Duration::from_millis(400)).await;
                            Some((Ok(vec![1u8; 1024]), 2))
                        }
                        _ => None,
                    }
                });
                axum::body::Body::from_stream(stream)
            }),
        ))
        .await;
        let temp = TempDir::new().unwrap();

        let mut config = DownloadConfig::default();
        config.progress_byte_interval = 1;
        config.progress_time_interval = Duration::from_millis(10);
        let mgr = DownloadManager::new(config).unwrap();

        let res = resource("m", format!("http://{addr}/drip"), temp.path(), "m.bin");
        let batch = mgr.submit_batch(&[res]);

        let mut mid_flight_bytes = 0;
        for _ in 0..100 {
            let task = mgr.task(batch.batch_id).unwrap();
            if task.status.is_terminal() {
                break;
            }
            if task.bytes_downloaded > 0 {
                mid_flight_bytes = task.bytes_downloaded;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(mid_flight_bytes > 0, "umbrella never reflected child bytes while live");

        assert_eq!(mgr.wait(batch.batch_id).await, Some(TaskStatus::Completed));
        let done = mgr.task(batch.batch_id).unwrap();
        assert_eq!(done.bytes_downloaded, 64 * 1024 + 1024);
    }

    #[tokio::test]
    async fn test_history_pruning_keeps_live_tasks() {
        let addr = serve(Router::new().route("/f", get(|| async { "x" }))).await;
        let temp = TempDir::new().unwrap();

        let mgr = DownloadManager::new(DownloadConfig::default().with_history_limit(2)).unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            let res = resource(
                &format!("m{i}"),
                format!("http://{addr}/f"),
                temp.path(),
                &format!("m{i}.bin"),
            );
            let id = mgr.submit(&res).unwrap();
            mgr.wait(id).await;
            ids.push(id);
        }

        assert!(mgr.tasks().len() <= 2);
        // The newest task is still present, the oldest ones aged out.
        assert!(mgr.task(ids[4]).is_some());
        assert!(mgr.task(ids[0]).is_none());
    }

    #[tokio::test]
    async fn test_clear_history_spares_live_tasks() {
        let addr = serve(Router::new().route("/f", get(|| async { "x" }))).await;
        let hang = serve(Router::new().route(
            "/hang",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        ))
        .await;
        let temp = TempDir::new().unwrap();

        let mgr = manager();
        let done = mgr
            .submit(&resource("done", format!("http://{addr}/f"), temp.path(), "done.bin"))
            .unwrap();
        mgr.wait(done).await;
        let live = mgr
            .submit(&resource("live", format!("http://{hang}/hang"), temp.path(), "live.bin"))
            .unwrap();

        assert_eq!(mgr.clear_history(), 1);
        assert!(mgr.task(done).is_none());
        assert!(mgr.task(live).is_some());
        mgr.cancel(live).unwrap();
        mgr.wait(live).await;
    }

    #[tokio::test]
    async fn test_events_end_with_terminal_status() {
        let addr = serve(Router::new().route("/f", get(|| async { "payload" }))).await;
        let temp = TempDir::new().unwrap();
        let res = resource("m", format!("http://{addr}/f"), temp.path(), "m.bin");

        let mgr = manager();
        let mut sub = mgr.subscribe();
        let id = mgr.submit(&res).unwrap();
        mgr.wait(id).await;

        let mut statuses = Vec::new();
        while let Some(event) = sub.try_recv() {
            assert_eq!(event.task_id, id);
            statuses.push(event.status);
        }
        assert_eq!(statuses.first(), Some(&TaskStatus::Waiting));
        assert_eq!(statuses.last(), Some(&TaskStatus::Completed));
        assert!(statuses.contains(&TaskStatus::Verifying));
    }
}
