//! HTTP API over the resolver and download manager.
//!
//! Thin axum layer: handlers validate input, call into the library, and
//! map domain errors to JSON error responses. Progress events stream
//! over a WebSocket, one broadcaster subscription per connection.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::downloads::{BatchSubmission, DownloadManager, ManagerError, TaskId};
use crate::metadata::{self, Metadata, MetadataError, MetadataResource};
use crate::registry::{HttpRegistry, RegistryError};
use crate::resolver::{ResolveOutcome, Resolver, Resource};

// ---------------------------------------------------------------------------
// State and errors
// ---------------------------------------------------------------------------

/// Shared state behind every handler. Cheap to clone.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<HttpRegistry>,
    pub resolver: Arc<Resolver<HttpRegistry>>,
    pub manager: DownloadManager,
}

impl ApiState {
    pub fn new(
        registry: Arc<HttpRegistry>,
        resolver: Arc<Resolver<HttpRegistry>>,
        manager: DownloadManager,
    ) -> Self {
        Self {
            registry,
            resolver,
            manager,
        }
    }
}

/// Handler-level error with a JSON body and a mapped status code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("bad request: {0}")]
    BadRequest(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Registry(e) => {
                warn!(error = %e, "registry error");
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
            ApiError::Metadata(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::Manager(e) => match e {
                ManagerError::NotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
                ManagerError::Unresolved { .. } => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
                ManagerError::AlreadyDownloaded { .. }
                | ManagerError::NotRetryable { .. }
                | ManagerError::BatchNotRetryable { .. } => (StatusCode::CONFLICT, e.to_string()),
                // Mapped to 200 in the download handler; reaching here
                // means a different handler surfaced it.
                ManagerError::DuplicateInFlight { .. } => (StatusCode::CONFLICT, e.to_string()),
            },
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the API router.
///
/// ```text
/// POST /fetch            -> fetch image metadata
/// POST /resolve          -> resolve metadata references
/// POST /download         -> submit one resource
/// POST /download-all     -> submit a batch under an umbrella task
/// POST /download-cancel  -> cancel one task or all tasks
/// POST /download-retry   -> retry a failed or cancelled task
/// GET  /tasks            -> list task snapshots
/// GET  /tasks/{id}       -> one task snapshot
/// GET  /events           -> WebSocket stream of task events
/// ```
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/fetch", post(fetch_handler))
        .route("/resolve", post(resolve_handler))
        .route("/download", post(download_handler))
        .route("/download-all", post(download_all_handler))
        .route("/download-cancel", post(cancel_handler))
        .route("/download-retry", post(retry_handler))
        .route("/tasks", get(list_tasks_handler))
        .route("/tasks/{id}", get(get_task_handler))
        .route("/events", get(events_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// POST /fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    /// Image id or image page URL.
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct FetchResponse {
    pub metadata: Metadata,
}

/// Fetch generation metadata for an image.
async fn fetch_handler(
    State(state): State<ApiState>,
    Json(input): Json<FetchRequest>,
) -> ApiResult<Json<FetchResponse>> {
    let image_id = metadata::parse_image_id(&input.image)?;
    let metadata = metadata::fetch_metadata(&state.registry, image_id)
        .await?
        .ok_or_else(|| ApiError::BadRequest(format!("image {image_id} not found")))?;
    info!(image_id, resources = metadata.resources.len(), "metadata fetched");
    Ok(Json(FetchResponse { metadata }))
}

// ---------------------------------------------------------------------------
// POST /resolve
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub refs: Vec<MetadataResource>,
}

/// Resolve metadata references to downloadable resources.
async fn resolve_handler(
    State(state): State<ApiState>,
    Json(input): Json<ResolveRequest>,
) -> ApiResult<Json<ResolveOutcome>> {
    let outcome = state.resolver.resolve(&input.refs).await;
    info!(
        resolved = outcome.resolved_count,
        unresolved = outcome.unresolved_count,
        "resolution finished"
    );
    Ok(Json(outcome))
}

// ---------------------------------------------------------------------------
// POST /download
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub resource: Resource,
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub task_id: TaskId,
    /// True when the id belongs to a pre-existing task for the same
    /// target rather than a new one.
    pub existing: bool,
}

/// Submit one resource for download.
///
/// A duplicate in-flight target is not an error for the caller: the
/// existing task id is returned so the caller can track it.
async fn download_handler(
    State(state): State<ApiState>,
    Json(input): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadResponse>> {
    match state.manager.submit(&input.resource) {
        Ok(task_id) => Ok(Json(DownloadResponse {
            task_id,
            existing: false,
        })),
        Err(ManagerError::DuplicateInFlight { task_id }) => {
            debug!(%task_id, "adopting in-flight task");
            Ok(Json(DownloadResponse {
                task_id,
                existing: true,
            }))
        }
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// POST /download-all
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DownloadAllRequest {
    pub resources: Vec<Resource>,
}

#[derive(Debug, Serialize)]
pub struct DownloadAllResponse {
    /// Id of the umbrella task aggregating the batch.
    pub task_id: TaskId,
    #[serde(flatten)]
    pub submission: BatchSubmission,
}

/// Submit every resource that needs a download under one umbrella task.
async fn download_all_handler(
    State(state): State<ApiState>,
    Json(input): Json<DownloadAllRequest>,
) -> ApiResult<Json<DownloadAllResponse>> {
    let submission = state.manager.submit_batch(&input.resources);
    Ok(Json(DownloadAllResponse {
        task_id: submission.batch_id,
        submission,
    }))
}

// ---------------------------------------------------------------------------
// POST /download-cancel
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub cancel_all: bool,
}

/// Cancel one task, or all live tasks when `cancel_all` is set.
async fn cancel_handler(
    State(state): State<ApiState>,
    Json(input): Json<CancelRequest>,
) -> ApiResult<Response> {
    match (input.task_id, input.cancel_all) {
        (Some(task_id), false) => {
            state.manager.cancel(task_id)?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        (None, true) => {
            let count = state.manager.cancel_all();
            debug!(count, "cancelled all live tasks");
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        _ => Err(ApiError::BadRequest(
            "provide either task_id or cancel_all".to_string(),
        )),
    }
}

// ---------------------------------------------------------------------------
// POST /download-retry
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub task_id: TaskId,
}

/// Restart a failed or cancelled task under its original id.
async fn retry_handler(
    State(state): State<ApiState>,
    Json(input): Json<RetryRequest>,
) -> ApiResult<Json<DownloadResponse>> {
    let task_id = state.manager.retry(input.task_id)?;
    Ok(Json(DownloadResponse {
        task_id,
        existing: false,
    }))
}

// ---------------------------------------------------------------------------
// GET /tasks, GET /tasks/{id}
// ---------------------------------------------------------------------------

async fn list_tasks_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.manager.tasks())
}

async fn get_task_handler(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    let task_id = TaskId(id);
    let task = state
        .manager
        .task(task_id)
        .ok_or(ManagerError::NotFound { task_id })?;
    Ok(Json(task))
}

// ---------------------------------------------------------------------------
// GET /events (WebSocket)
// ---------------------------------------------------------------------------

/// Upgrade to a WebSocket and stream task events as JSON frames.
async fn events_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_events(socket, state.manager))
}

async fn stream_events(socket: WebSocket, manager: DownloadManager) {
    let mut subscriber = manager.subscribe();
    let (mut sink, mut stream) = socket.split();
    debug!("event stream connected");

    loop {
        tokio::select! {
            event = subscriber.recv() => {
                let Some(event) = event else { break };
                let frame = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "event stream receive error");
                        break;
                    }
                }
            }
        }
    }

    debug!("event stream disconnected");
}
