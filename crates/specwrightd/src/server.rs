//! HTTP control plane for specwrightd.
//!
//! Thin handlers over the core components, bound to 127.0.0.1 with optional
//! bearer-token auth. Conflicting state maps to 409, client faults to 400,
//! unknown ids to 404; session and worker progress stream as SSE.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use specwright_core::{Config, Id, QueueItem, Worker};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::bus::{EventBus, WORKERS_TOPIC};
use crate::chunk_runner::{ChunkRunner, RunOptions};
use crate::gateway::{ExecutorAgent, ReviewerAgent};
use crate::janitor::WorktreeJanitor;
use crate::pool::{PoolError, WorkerPool};
use crate::session::{LiveSink, NullSink, SessionError, Sessions};
use crate::storage::{Storage, StorageError};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub sessions: Arc<Sessions>,
    pub pool: Arc<WorkerPool>,
    pub bus: Arc<EventBus>,
    pub janitor: Arc<WorktreeJanitor>,
    pub executor: Arc<dyn ExecutorAgent>,
    pub reviewer: Arc<dyn ReviewerAgent>,
    pub config: Config,
    pub auth_token: Option<String>,
    /// Abort flags for single-chunk executions in flight.
    chunk_aborts: Mutex<HashMap<Id, Arc<AtomicBool>>>,
}

impl AppState {
    pub fn new(
        storage: Arc<Storage>,
        sessions: Arc<Sessions>,
        pool: Arc<WorkerPool>,
        bus: Arc<EventBus>,
        janitor: Arc<WorktreeJanitor>,
        executor: Arc<dyn ExecutorAgent>,
        reviewer: Arc<dyn ReviewerAgent>,
        config: Config,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            storage,
            sessions,
            pool,
            bus,
            janitor,
            executor,
            reviewer,
            config,
            auth_token,
            chunk_aborts: Mutex::new(HashMap::new()),
        }
    }
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/specs/{id}/run-all", post(run_all))
        .route("/specs/{id}/run-all/abort", post(abort_run_all))
        .route("/specs/{id}/chunks/reorder", post(reorder_chunks))
        .route("/chunks/{id}/run", post(run_chunk))
        .route("/chunks/{id}/abort", post(abort_chunk))
        .route("/chunks/{id}/dependencies", put(set_dependencies))
        .route("/workers", post(start_worker))
        .route("/workers/events", get(worker_events))
        .route("/workers/{id}/pause", post(pause_worker))
        .route("/workers/{id}/resume", post(resume_worker))
        .route("/workers/{id}/stop", post(stop_worker))
        .route("/queue", post(enqueue_spec))
        .route("/queue/reorder", post(reorder_queue))
        .route("/worktrees/stale", get(stale_worktrees))
        .route("/worktrees/cleanup", post(cleanup_worktrees))
        .route("/worktrees/{spec_id}", delete(delete_worktree))
        .route("/health", get(health_check))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server, bound to localhost only.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

// --- Error plumbing ---

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn storage_error(e: StorageError) -> ApiError {
    match e {
        StorageError::ProjectNotFound(_)
        | StorageError::SpecNotFound(_)
        | StorageError::ChunkNotFound(_)
        | StorageError::WorkerNotFound(_) => api_error(StatusCode::NOT_FOUND, e.to_string()),
        StorageError::InvalidDependencies(_) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
        other => {
            error!("storage error: {other}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

fn session_error(e: SessionError) -> ApiError {
    match e {
        SessionError::AlreadyRunning(_) => api_error(StatusCode::CONFLICT, e.to_string()),
        SessionError::NoRunnableChunks | SessionError::Path(_) => {
            api_error(StatusCode::BAD_REQUEST, e.to_string())
        }
        SessionError::Storage(inner) => storage_error(inner),
    }
}

fn pool_error(e: PoolError) -> ApiError {
    match e {
        PoolError::AtCapacity | PoolError::AlreadyRunning(_) => {
            api_error(StatusCode::CONFLICT, e.to_string())
        }
        PoolError::NotActive(_) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
        PoolError::Session(inner) => session_error(inner),
        PoolError::Storage(inner) => storage_error(inner),
    }
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if let Some(expected) = &state.auth_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

        match provided {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(api_error(StatusCode::UNAUTHORIZED, "invalid auth token")),
            None => Err(api_error(StatusCode::UNAUTHORIZED, "missing auth token")),
        }
    } else {
        Ok(())
    }
}

// --- Request/response types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDependenciesRequest {
    pub dependencies: Vec<Id>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderChunksRequest {
    pub chunk_ids: Vec<Id>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkerRequest {
    pub spec_id: Id,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub spec_id: Id,
    #[serde(default)]
    pub priority: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderQueueRequest {
    pub queue_ids: Vec<Id>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleWorktreesResponse {
    pub stale_worktrees: Vec<crate::janitor::StaleWorktree>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkersSnapshot {
    workers: Vec<Worker>,
    queue: Vec<QueueItem>,
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /specs/{id}/run-all - start a run session, streaming its events.
async fn run_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    check_auth(&state, &headers)?;

    let spec_id = Id::from_string(&id);
    let prepared = state
        .sessions
        .prepare(&spec_id)
        .await
        .map_err(session_error)?;

    let (sink, rx) = LiveSink::channel();
    tokio::spawn(async move {
        prepared.run(sink).await;
    });
    info!(spec_id = %spec_id, "run-all started");

    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| {
            let sse = SseEvent::default()
                .event(event.name())
                .id(event.seq.to_string())
                .data(event.to_json().unwrap_or_default());
            (Ok::<_, Infallible>(sse), rx)
        })
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// POST /specs/{id}/run-all/abort - set the session's abort flag.
async fn abort_run_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let spec_id = Id::from_string(&id);
    let aborted = state.sessions.abort(&spec_id);
    info!(spec_id = %spec_id, aborted, "abort requested");
    Ok(Json(serde_json::json!({ "aborted": aborted })))
}

/// POST /chunks/{id}/run - start a single-chunk execution.
async fn run_chunk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let chunk_id = Id::from_string(&id);
    let chunk = state
        .storage
        .get_chunk(&chunk_id)
        .await
        .map_err(storage_error)?;
    let spec = state
        .storage
        .get_spec(&chunk.spec_id)
        .await
        .map_err(storage_error)?;
    let project = state
        .storage
        .get_project(&spec.project_id)
        .await
        .map_err(storage_error)?;

    {
        let aborts = state.chunk_aborts.lock().unwrap_or_else(|e| e.into_inner());
        if aborts.contains_key(&chunk_id) {
            return Err(api_error(StatusCode::CONFLICT, "chunk is already running"));
        }
    }
    if state.sessions.is_active(&spec.id) {
        return Err(api_error(
            StatusCode::CONFLICT,
            "a run-all session owns this spec's worktree",
        ));
    }

    let root = state
        .config
        .workspace_root
        .as_deref()
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/"));
    let project_dir = crate::paths::validate_within(std::path::Path::new(&project.directory), &root)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let workdir = spec
        .worktree_path
        .as_deref()
        .map(PathBuf::from)
        .filter(|p| p.exists())
        .unwrap_or(project_dir);

    let abort = Arc::new(AtomicBool::new(false));
    state
        .chunk_aborts
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(chunk_id.clone(), Arc::clone(&abort));

    let runner = ChunkRunner::new(
        Arc::clone(&state.storage),
        Arc::clone(&state.executor),
        Arc::clone(&state.reviewer),
        state.config.clone(),
    );
    let state_for_task = Arc::clone(&state);
    let task_chunk_id = chunk_id.clone();
    tokio::spawn(async move {
        let sink = NullSink;
        if let Err(e) = runner
            .run(&chunk, &workdir, &sink, &abort, RunOptions::default())
            .await
        {
            warn!(chunk_id = %task_chunk_id, error = %e, "single-chunk run failed");
        }
        state_for_task
            .chunk_aborts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_chunk_id);
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "chunkId": chunk_id, "started": true })),
    ))
}

/// POST /chunks/{id}/abort - abort a single-chunk execution.
async fn abort_chunk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let chunk_id = Id::from_string(&id);
    let flag = {
        let aborts = state.chunk_aborts.lock().unwrap_or_else(|e| e.into_inner());
        aborts.get(&chunk_id).cloned()
    };
    let Some(flag) = flag else {
        return Err(api_error(StatusCode::NOT_FOUND, "no execution for chunk"));
    };

    flag.store(true, Ordering::SeqCst);
    let _ = state.executor.abort(&chunk_id).await;
    Ok(Json(serde_json::json!({ "aborted": true })))
}

/// PUT /chunks/{id}/dependencies - replace a chunk's dependencies.
///
/// Rejects with 400 when the assignment would close a cycle; the stored
/// graph is untouched in that case.
async fn set_dependencies(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<SetDependenciesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let chunk_id = Id::from_string(&id);
    state
        .storage
        .update_chunk_dependencies(&chunk_id, &req.dependencies)
        .await
        .map_err(storage_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /specs/{id}/chunks/reorder - persist a new chunk order.
async fn reorder_chunks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ReorderChunksRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let spec_id = Id::from_string(&id);
    state
        .storage
        .get_spec(&spec_id)
        .await
        .map_err(storage_error)?;
    state
        .storage
        .reorder_chunks(&spec_id, &req.chunk_ids)
        .await
        .map_err(storage_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /workers - promote a spec to a worker slot.
async fn start_worker(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<StartWorkerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let worker = state
        .pool
        .start_worker(&req.spec_id)
        .await
        .map_err(pool_error)?;
    Ok((StatusCode::CREATED, Json(worker)))
}

/// POST /workers/{id}/pause - cooperative pause at the next chunk boundary.
async fn pause_worker(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    state
        .pool
        .pause(&Id::from_string(&id))
        .await
        .map_err(pool_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /workers/{id}/resume - clear the pause flag.
async fn resume_worker(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    state
        .pool
        .resume(&Id::from_string(&id))
        .await
        .map_err(pool_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /workers/{id}/stop - abort the worker's underlying session.
async fn stop_worker(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    state
        .pool
        .stop(&Id::from_string(&id))
        .await
        .map_err(pool_error)?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /queue - enqueue a spec (or promote it immediately).
async fn enqueue_spec(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let item = state
        .pool
        .add_to_queue(&req.spec_id, req.priority.unwrap_or(0))
        .await
        .map_err(pool_error)?;
    Ok((StatusCode::CREATED, Json(item)))
}

/// POST /queue/reorder - persist a new queue order.
async fn reorder_queue(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ReorderQueueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    state
        .storage
        .reorder_queue(&req.queue_ids)
        .await
        .map_err(storage_error)?;
    state
        .bus
        .publish_worker(&specwright_core::WorkerEvent::QueueUpdated);
    Ok(StatusCode::NO_CONTENT)
}

/// GET /workers/events - SSE stream: a snapshot, then bus deltas.
async fn worker_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    check_auth(&state, &headers)?;

    // Subscribe before snapshotting so nothing falls in the gap.
    let rx = state.bus.subscribe(WORKERS_TOPIC);

    let snapshot = WorkersSnapshot {
        workers: state
            .storage
            .active_workers()
            .await
            .map_err(storage_error)?,
        queue: state.storage.queue_items().await.map_err(storage_error)?,
    };
    let snapshot_event = SseEvent::default()
        .event("snapshot")
        .data(serde_json::to_string(&snapshot).unwrap_or_default());

    let deltas = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    let sse = SseEvent::default().event(&message.name).data(message.data);
                    return Some((Ok::<_, Infallible>(sse), rx));
                }
                // Best-effort delivery: lagging drops events, then resumes.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    let stream = stream::iter(vec![Ok::<_, Infallible>(snapshot_event)]).chain(deltas);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /worktrees/stale - list stale worktrees.
async fn stale_worktrees(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let stale = state.janitor.list_stale().await.map_err(|e| {
        error!("stale listing failed: {e}");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    Ok(Json(StaleWorktreesResponse {
        stale_worktrees: stale,
    }))
}

/// POST /worktrees/cleanup - sweep worktrees. The body is optional;
/// `{"force": true}` also removes stale unmerged worktrees.
async fn cleanup_worktrees(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let force = serde_json::from_slice::<CleanupRequest>(&body)
        .map(|req| req.force)
        .unwrap_or(false);
    let report = state.janitor.cleanup(force).await.map_err(|e| {
        error!("cleanup failed: {e}");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    Ok(Json(report))
}

/// DELETE /worktrees/{spec_id} - unconditional worktree removal.
async fn delete_worktree(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(spec_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let spec_id = Id::from_string(&spec_id);
    state.janitor.delete(&spec_id).await.map_err(|e| match e {
        crate::janitor::JanitorError::Storage(inner) => storage_error(inner),
    })?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::fake::{FakeExecutor, FakeReviewer};
    use crate::storage::tests::{create_test_storage, test_chunk, test_project, test_spec, TestStorage};
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use tower::ServiceExt;

    async fn create_test_app(auth_token: Option<String>) -> (Router, TestStorage) {
        let ts = create_test_storage().await;
        let storage = Arc::clone(&ts.storage);

        let executor: Arc<dyn ExecutorAgent> = Arc::new(FakeExecutor::default());
        let reviewer: Arc<dyn ReviewerAgent> = Arc::new(FakeReviewer::always_pass());
        let mut config = Config::default();
        config.review_retry_backoff_ms = 1;
        let sessions = Arc::new(Sessions::new(
            Arc::clone(&storage),
            Arc::clone(&executor),
            Arc::clone(&reviewer),
            config.clone(),
        ));
        let bus = Arc::new(EventBus::new());
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&storage),
            Arc::clone(&sessions),
            Arc::clone(&bus),
            config.max_workers,
        ));
        let janitor = Arc::new(WorktreeJanitor::new(
            Arc::clone(&storage),
            Arc::clone(&sessions),
            config.stale_worktree_days,
        ));

        let state = Arc::new(AppState::new(
            storage, sessions, pool, bus, janitor, executor, reviewer, config, auth_token,
        ));
        (create_router(state), ts)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let (app, _ts) = create_test_app(None).await;
        let response: Response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn run_all_unknown_spec_returns_404() {
        let (app, _ts) = create_test_app(None).await;
        let response: Response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/specs/ghost/run-all")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn run_all_without_runnable_chunks_returns_400() {
        let (app, ts) = create_test_app(None).await;
        ts.storage.insert_project(&test_project("p1")).await.unwrap();
        ts.storage.insert_spec(&test_spec("s1", "p1")).await.unwrap();

        let response: Response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/specs/s1/run-all")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dependency_cycle_returns_400_and_store_is_unchanged() {
        let (app, ts) = create_test_app(None).await;
        ts.storage.insert_project(&test_project("p1")).await.unwrap();
        ts.storage.insert_spec(&test_spec("s1", "p1")).await.unwrap();
        ts.storage
            .insert_chunk(&test_chunk("a", "s1", 0, &[]))
            .await
            .unwrap();
        ts.storage
            .insert_chunk(&test_chunk("b", "s1", 1, &["a"]))
            .await
            .unwrap();

        let response: Response = app
            .oneshot(json_request(
                "PUT",
                "/chunks/a/dependencies",
                serde_json::json!({ "dependencies": ["b"] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let a = ts.storage.get_chunk(&Id::from_string("a")).await.unwrap();
        assert!(a.dependencies.is_empty());
    }

    #[tokio::test]
    async fn valid_dependencies_are_accepted() {
        let (app, ts) = create_test_app(None).await;
        ts.storage.insert_project(&test_project("p1")).await.unwrap();
        ts.storage.insert_spec(&test_spec("s1", "p1")).await.unwrap();
        ts.storage
            .insert_chunk(&test_chunk("a", "s1", 0, &[]))
            .await
            .unwrap();
        ts.storage
            .insert_chunk(&test_chunk("b", "s1", 1, &[]))
            .await
            .unwrap();

        let response: Response = app
            .oneshot(json_request(
                "PUT",
                "/chunks/b/dependencies",
                serde_json::json!({ "dependencies": ["a"] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let b = ts.storage.get_chunk(&Id::from_string("b")).await.unwrap();
        assert_eq!(b.dependencies, vec![Id::from_string("a")]);
    }

    #[tokio::test]
    async fn chunk_reorder_persists_new_order() {
        let (app, ts) = create_test_app(None).await;
        ts.storage.insert_project(&test_project("p1")).await.unwrap();
        ts.storage.insert_spec(&test_spec("s1", "p1")).await.unwrap();
        for (id, order) in [("a", 0), ("b", 1)] {
            ts.storage
                .insert_chunk(&test_chunk(id, "s1", order, &[]))
                .await
                .unwrap();
        }

        let response: Response = app
            .oneshot(json_request(
                "POST",
                "/specs/s1/chunks/reorder",
                serde_json::json!({ "chunkIds": ["b", "a"] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let chunks = ts.storage.chunks_by_spec(&Id::from_string("s1")).await.unwrap();
        let ids: Vec<&str> = chunks.iter().map(|c| c.id.as_ref()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn worker_routes_enforce_capacity_with_409() {
        let (app, ts) = create_test_app(None).await;
        ts.storage.insert_project(&test_project("p1")).await.unwrap();
        // Fill every slot with active worker rows.
        for i in 0..5 {
            let spec = test_spec(&format!("s{i}"), "p1");
            ts.storage.insert_spec(&spec).await.unwrap();
            ts.storage
                .insert_worker(&specwright_core::Worker {
                    id: Id::new(),
                    spec_id: spec.id.clone(),
                    project_id: Id::from_string("p1"),
                    status: specwright_core::WorkerStatus::Running,
                    current_chunk_id: None,
                    current_step: None,
                    progress: specwright_core::WorkerProgress::default(),
                    started_at: None,
                    completed_at: None,
                    error: None,
                })
                .await
                .unwrap();
        }
        let spec = test_spec("target", "p1");
        ts.storage.insert_spec(&spec).await.unwrap();
        ts.storage
            .insert_chunk(&test_chunk("c", "target", 0, &[]))
            .await
            .unwrap();

        let response: Response = app
            .oneshot(json_request(
                "POST",
                "/workers",
                serde_json::json!({ "specId": "target" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn queue_routes_round_trip() {
        let (app, ts) = create_test_app(None).await;
        ts.storage.insert_project(&test_project("p1")).await.unwrap();
        let spec = test_spec("s1", "p1");
        ts.storage.insert_spec(&spec).await.unwrap();
        ts.storage
            .insert_chunk(&test_chunk("c", "s1", 0, &[]))
            .await
            .unwrap();

        // Capacity is free, so the spec promotes straight to a worker.
        let response: Response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/queue",
                serde_json::json!({ "specId": "s1", "priority": 3 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response: Response = app
            .oneshot(json_request(
                "POST",
                "/queue/reorder",
                serde_json::json!({ "queueIds": [] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn stale_worktrees_empty_by_default() {
        let (app, _ts) = create_test_app(None).await;
        let response: Response = app
            .oneshot(
                Request::builder()
                    .uri("/worktrees/stale")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["staleWorktrees"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn cleanup_reports_empty_sweep() {
        let (app, _ts) = create_test_app(None).await;
        let response: Response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/worktrees/cleanup")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_token_is_enforced_when_configured() {
        let (app, _ts) = create_test_app(Some("secret-token".to_string())).await;

        let response: Response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/worktrees/stale")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response: Response = app
            .oneshot(
                Request::builder()
                    .uri("/worktrees/stale")
                    .header("authorization", "Bearer secret-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn abort_without_session_reports_false() {
        let (app, _ts) = create_test_app(None).await;
        let response: Response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/specs/s1/run-all/abort")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["aborted"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn abort_unknown_chunk_returns_404() {
        let (app, _ts) = create_test_app(None).await;
        let response: Response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chunks/ghost/abort")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
