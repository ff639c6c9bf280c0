//! Controller HTTP API.
//!
//! Initiators submit build requests here and either stay on the
//! event stream or detach with the build id. The ledger records every
//! request so detached clients can query or cancel later; build
//! execution runs in a background task per request.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::stream::Stream;
use morph_core::protocol::{BuildInfo, BuildRequest, BuildStatus, Message};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::scheduler::BuildEvent;
use crate::storage::{Storage, StorageError};
use crate::BuildEngine;

/// Live channels of one in-flight build.
struct BuildHandle {
    events: broadcast::Sender<Message>,
    cancel: CancellationToken,
}

/// Shared state for HTTP handlers.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub engine: Arc<BuildEngine>,
    builds: Mutex<HashMap<String, BuildHandle>>,
}

impl AppState {
    pub fn new(storage: Arc<Storage>, engine: Arc<BuildEngine>) -> Self {
        Self {
            storage,
            engine,
            builds: Mutex::new(HashMap::new()),
        }
    }
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/1.0/builds", post(create_build).get(list_builds))
        .route("/1.0/builds/{id}", get(get_build))
        .route("/1.0/builds/{id}/cancel", post(cancel_build))
        .route("/1.0/builds/{id}/events", get(stream_events))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Start the controller server.
pub async fn start_server(
    storage: Arc<Storage>,
    engine: Arc<BuildEngine>,
    address: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = Arc::new(AppState::new(storage, engine));
    let router = create_router(state);

    let addr: SocketAddr = format!("{address}:{port}").parse()?;
    info!("controller listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

// --- Request/Response types ---

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct CreateBuildResponse {
    pub id: String,
    pub status: BuildStatus,
}

#[derive(Debug, Serialize)]
pub struct ListBuildsResponse {
    pub builds: Vec<BuildInfo>,
}

fn storage_error(e: StorageError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        StorageError::BuildNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_build(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BuildRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let id = Uuid::now_v7().to_string();
    let now = Utc::now();
    let info = BuildInfo {
        id: id.clone(),
        repo: request.repo.clone(),
        commit: request.commit.clone(),
        morphology: request.morphology.clone(),
        original_ref: request.original_ref.clone(),
        component_names: request.component_names.clone(),
        status: BuildStatus::Pending,
        error: None,
        created_at: now,
        updated_at: now,
    };
    state
        .storage
        .insert_build(&info)
        .await
        .map_err(storage_error)?;

    let (events, _) = broadcast::channel(1024);
    let cancel = CancellationToken::new();
    state.builds.lock().await.insert(
        id.clone(),
        BuildHandle {
            events: events.clone(),
            cancel: cancel.clone(),
        },
    );

    info!(
        build = %id,
        repo = %request.repo,
        morphology = %request.morphology,
        "accepted build request"
    );
    tokio::spawn(run_build(
        Arc::clone(&state),
        id.clone(),
        request,
        events,
        cancel,
    ));

    Ok((
        StatusCode::CREATED,
        Json(CreateBuildResponse {
            id,
            status: BuildStatus::Pending,
        }),
    ))
}

/// Drive one build request to completion, mirroring progress into the
/// ledger and the event channel.
async fn run_build(
    state: Arc<AppState>,
    id: String,
    request: BuildRequest,
    events: broadcast::Sender<Message>,
    cancel: CancellationToken,
) {
    let set_status = |status: BuildStatus, error: Option<String>| {
        let state = Arc::clone(&state);
        let id = id.clone();
        async move {
            if let Err(e) = state
                .storage
                .update_build_status(&id, status, error.as_deref())
                .await
            {
                error!(build = %id, error = %e, "failed to update build status");
            }
        }
    };

    let _ = events.send(Message::BuildStarted { id: id.clone() });
    set_status(BuildStatus::Resolving, None).await;

    let (scheduler_events, mut scheduler_rx) = tokio::sync::mpsc::unbounded_channel();
    let forwarder = {
        let events = events.clone();
        let id = id.clone();
        tokio::spawn(async move {
            while let Some(event) = scheduler_rx.recv().await {
                let message = match event {
                    BuildEvent::Status(message) => Message::StatusEvent {
                        id: id.clone(),
                        message,
                        timestamp: Utc::now(),
                    },
                    BuildEvent::ArtifactStarted(artifact) => Message::StatusEvent {
                        id: id.clone(),
                        message: format!("building {artifact}"),
                        timestamp: Utc::now(),
                    },
                    BuildEvent::ArtifactBuilt(artifact) => Message::StatusEvent {
                        id: id.clone(),
                        message: format!("built {artifact}"),
                        timestamp: Utc::now(),
                    },
                    BuildEvent::ArtifactFailed { artifact, reason } => Message::LogChunk {
                        id: id.clone(),
                        artifact,
                        chunk: reason,
                    },
                };
                let _ = events.send(message);
            }
        })
    };

    set_status(BuildStatus::Building, None).await;
    let build = state.engine.build(
        &request.repo,
        &request.commit,
        &request.morphology,
        request.original_ref.as_deref(),
        &request.component_names,
        Some(scheduler_events),
    );

    let outcome = tokio::select! {
        result = build => Some(result),
        () = cancel.cancelled() => None,
    };
    forwarder.abort();

    match outcome {
        None => {
            // Cancelled mid-build; staging cleanup is the GC's job.
            set_status(BuildStatus::Cancelled, None).await;
            let _ = events.send(Message::BuildFailed {
                id: id.clone(),
                reason: "build cancelled".to_string(),
            });
        }
        Some(Ok(report)) if report.succeeded() => {
            set_status(BuildStatus::Complete, None).await;
            let _ = events.send(Message::BuildComplete { id: id.clone() });
        }
        Some(Ok(report)) => {
            let reason = report
                .failures()
                .first()
                .map(|(artifact, reason)| format!("{artifact}: {reason}"))
                .unwrap_or_else(|| "build failed".to_string());
            set_status(BuildStatus::Failed, Some(reason.clone())).await;
            let _ = events.send(Message::BuildFailed {
                id: id.clone(),
                reason,
            });
        }
        Some(Err(e)) => {
            let reason = e.to_string();
            set_status(BuildStatus::Failed, Some(reason.clone())).await;
            let _ = events.send(Message::BuildFailed {
                id: id.clone(),
                reason,
            });
        }
    }

    state.builds.lock().await.remove(&id);
}

async fn list_builds(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let builds = state.storage.list_builds().await.map_err(storage_error)?;
    Ok(Json(ListBuildsResponse { builds }))
}

async fn get_build(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let build = state.storage.get_build(&id).await.map_err(storage_error)?;
    Ok(Json(build))
}

async fn cancel_build(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let build = state.storage.get_build(&id).await.map_err(storage_error)?;
    if build.status.is_terminal() {
        return Err((
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: format!("build {id} already {}", build.status.as_str()),
            }),
        ));
    }

    if let Some(handle) = state.builds.lock().await.get(&id) {
        handle.cancel.cancel();
    } else {
        // Not running (e.g. controller restarted); settle the ledger.
        state
            .storage
            .update_build_status(&id, BuildStatus::Cancelled, None)
            .await
            .map_err(storage_error)?;
    }
    Ok(StatusCode::ACCEPTED)
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<
    Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>>,
    (StatusCode, Json<ErrorResponse>),
> {
    let build = state.storage.get_build(&id).await.map_err(storage_error)?;
    let receiver = state
        .builds
        .lock()
        .await
        .get(&id)
        .map(|handle| handle.events.subscribe());

    let initial = Message::StatusEvent {
        id: build.id.clone(),
        message: format!("status {}", build.status.as_str()),
        timestamp: Utc::now(),
    };

    let stream = event_stream(initial, build, receiver);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn event_stream(
    initial: Message,
    build: BuildInfo,
    receiver: Option<broadcast::Receiver<Message>>,
) -> impl Stream<Item = std::result::Result<SseEvent, Infallible>> {
    futures_util::stream::unfold(
        (Some(initial), build, receiver),
        |(initial, build, mut receiver)| async move {
            if let Some(message) = initial {
                let event = message_event(&message);
                return Some((Ok(event), (None, build, receiver)));
            }
            // Terminal builds have nothing further to say.
            if build.status.is_terminal() {
                return None;
            }
            let Some(rx) = receiver.as_mut() else {
                return None;
            };
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        let done = matches!(
                            message,
                            Message::BuildComplete { .. } | Message::BuildFailed { .. }
                        );
                        let event = message_event(&message);
                        let next_build = {
                            let mut next = build;
                            if done {
                                next.status = BuildStatus::Complete;
                            }
                            next
                        };
                        return Some((Ok(event), (None, next_build, receiver)));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    )
}

fn message_event(message: &Message) -> SseEvent {
    let data = message
        .to_json()
        .unwrap_or_else(|_| "{\"type\":\"status-event\"}".to_string());
    SseEvent::default().data(data)
}
