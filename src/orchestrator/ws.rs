//! WebSocket + REST surface of the orchestrator.
//!
//! Workers attach at `/ws` with a persistent duplex connection; requesters
//! use the REST API to submit, inspect and cancel tasks, and may subscribe
//! to per-task push updates at `/api/tasks/{id}/ws`.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ProtocolError, TaskError, TaskFailure};
use crate::orchestrator::dispatcher::Dispatcher;
use crate::orchestrator::relay::TaskEvent;
use crate::protocol::{AgentMessage, CapabilityType, ServerMessage};

/// Outbox depth per worker connection. Assignments and cancels only, so
/// shallow is fine.
const WORKER_OUTBOX_CAPACITY: usize = 32;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

/// Build the Axum router for worker connections and the requester API.
pub fn api_routes(dispatcher: Arc<Dispatcher>) -> Router {
    let state = AppState { dispatcher };

    Router::new()
        .route("/ws", get(worker_ws_handler))
        .route("/health", get(health))
        .route("/api/tasks", post(submit_task).get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/ws", get(task_ws_handler))
        .route("/api/workers", get(list_workers))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "scrape-fleet",
        "workers": state.dispatcher.list_workers().await.len(),
    }))
}

// ── Worker WebSocket ────────────────────────────────────────────────────

async fn worker_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    debug!("Worker connecting");
    ws.on_upgrade(|socket| handle_worker_socket(socket, state.dispatcher))
}

/// Contents of a valid first frame.
struct Registration {
    capability: CapabilityType,
    token: String,
    display_name: String,
}

/// Authenticating phase: the first frame must be a valid register within
/// the handshake window.
async fn read_register(
    socket: &mut WebSocket,
    window: std::time::Duration,
) -> Result<Registration, ProtocolError> {
    let frame = timeout(window, socket.recv())
        .await
        .map_err(|_| ProtocolError::RegisterTimeout)?;

    match frame {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<AgentMessage>(&text)? {
            AgentMessage::Register {
                capability,
                token,
                display_name,
            } => Ok(Registration {
                capability,
                token,
                display_name,
            }),
            other => Err(ProtocolError::NotRegistered {
                got: frame_name(&other).to_string(),
            }),
        },
        _ => Err(ProtocolError::ConnectionClosed),
    }
}

fn frame_name(msg: &AgentMessage) -> &'static str {
    match msg {
        AgentMessage::Register { .. } => "register",
        AgentMessage::Heartbeat { .. } => "heartbeat",
        AgentMessage::TaskStatus { .. } => "task_status",
        AgentMessage::TaskResult { .. } => "task_result",
    }
}

async fn handle_worker_socket(mut socket: WebSocket, dispatcher: Arc<Dispatcher>) {
    let registration =
        match read_register(&mut socket, dispatcher.config().register_timeout).await {
            Ok(registration) => registration,
            Err(e @ (ProtocolError::RegisterTimeout | ProtocolError::ConnectionClosed)) => {
                debug!(error = %e, "Connection dropped before registering");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Connection closed during handshake");
                reject(&mut socket, &e.to_string()).await;
                return;
            }
        };

    let Registration {
        capability,
        token,
        display_name,
    } = registration;

    if !dispatcher.authorize(capability, &token) {
        let e = ProtocolError::AuthenticationFailed;
        warn!(%capability, display_name, "Authentication failed, closing connection");
        reject(&mut socket, &e.to_string()).await;
        return;
    }

    // Ack goes on the wire before the worker can be handed work, so the
    // agent always sees register_ack ahead of any task_assign.
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<ServerMessage>(WORKER_OUTBOX_CAPACITY);
    let worker_id = Uuid::new_v4();
    let ack = ServerMessage::RegisterAck { worker_id };
    if let Ok(json) = serde_json::to_string(&ack) {
        if socket.send(Message::Text(json.into())).await.is_err() {
            debug!("Worker dropped before register_ack");
            return;
        }
    }
    let worker_id = dispatcher
        .register_with_id(worker_id, capability, display_name, outbox_tx)
        .await;

    loop {
        tokio::select! {
            // Assignments and cancels from the dispatcher.
            outbound = outbox_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        let Ok(json) = serde_json::to_string(&msg) else { continue };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            debug!(%worker_id, "Socket write failed");
                            break;
                        }
                    }
                    // Registry record dropped (heartbeat sweep or stale-task
                    // force-disconnect): close the socket.
                    None => {
                        debug!(%worker_id, "Outbox closed, shutting socket down");
                        break;
                    }
                }
            }

            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_agent_frame(&dispatcher, worker_id, &text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(%worker_id, "Worker closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(%worker_id, error = %e, "Worker socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // Idempotent: the sweep may already have removed this worker.
    dispatcher.disconnect_worker(worker_id, TaskFailure::WorkerLost).await;
}

async fn reject(socket: &mut WebSocket, reason: &str) {
    let msg = ServerMessage::RegisterReject { reason: reason.to_string() };
    if let Ok(json) = serde_json::to_string(&msg) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn handle_agent_frame(dispatcher: &Dispatcher, worker_id: Uuid, text: &str) {
    match serde_json::from_str::<AgentMessage>(text) {
        Ok(AgentMessage::Heartbeat { timestamp }) => {
            if !dispatcher.heartbeat(worker_id).await {
                debug!(%worker_id, %timestamp, "Heartbeat from unknown worker");
            }
        }
        Ok(AgentMessage::TaskStatus { task_id, status }) => {
            if let Err(e) = dispatcher.report_status(task_id, worker_id, status).await {
                warn!(%task_id, %worker_id, error = %e, "Status report dropped");
            }
        }
        Ok(AgentMessage::TaskResult {
            task_id,
            success,
            result,
            error,
        }) => {
            if let Err(e) = dispatcher
                .report_result(task_id, worker_id, success, result, error)
                .await
            {
                warn!(%task_id, %worker_id, error = %e, "Result report dropped");
            }
        }
        Ok(AgentMessage::Register { .. }) => {
            warn!(%worker_id, "Duplicate register frame ignored");
        }
        Err(e) => {
            debug!(%worker_id, error = %e, text, "Unrecognized frame from worker");
        }
    }
}

// ── Requester REST ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SubmitRequest {
    capability: String,
    #[serde(default)]
    payload: serde_json::Value,
}

async fn submit_task(
    State(state): State<AppState>,
    Json(body): Json<SubmitRequest>,
) -> impl IntoResponse {
    let capability = match CapabilityType::from_str(&body.capability) {
        Ok(capability) => capability,
        Err(_) => {
            let err = TaskError::InvalidCapability(body.capability);
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": err.to_string()})),
            );
        }
    };

    let view = state.dispatcher.submit(capability, body.payload).await;
    (
        StatusCode::CREATED,
        Json(serde_json::json!({"task_id": view.task_id, "state": view.state})),
    )
}

async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.dispatcher.list_tasks().await)
}

async fn list_workers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.dispatcher.list_workers().await)
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let Ok(task_id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid task ID"})),
        );
    };

    match state.dispatcher.get_task(task_id).await {
        Some(view) => (StatusCode::OK, Json(serde_json::json!(view))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Task not found"})),
        ),
    }
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let Ok(task_id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid task ID"})),
        );
    };

    match state.dispatcher.cancel(task_id).await {
        Ok(view) => (StatusCode::OK, Json(serde_json::json!(view))),
        Err(e @ TaskError::NotFound { .. }) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
        Err(e @ TaskError::AlreadyTerminal { .. }) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}

// ── Requester task subscription ─────────────────────────────────────────

async fn task_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(task_id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid task ID"})),
        )
            .into_response();
    };
    if state.dispatcher.get_task(task_id).await.is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Task not found"})),
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_task_subscription(socket, state.dispatcher, task_id))
        .into_response()
}

/// Push updates for one task to a requester. A current snapshot goes out
/// first; after that, relay events for this task in emission order.
/// Updates delivered before a requester connects are not replayed.
async fn handle_task_subscription(mut socket: WebSocket, dispatcher: Arc<Dispatcher>, task_id: Uuid) {
    debug!(%task_id, "Requester subscribed to task updates");

    // Subscribe before the snapshot so nothing falls between them.
    let mut rx = dispatcher.relay().subscribe();

    if let Some(view) = dispatcher.get_task(task_id).await {
        if let Ok(json) = serde_json::to_string(&serde_json::json!({"snapshot": view})) {
            if socket.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(TaskEvent { task_id: event_task, .. }) if event_task != task_id => {}
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(%task_id, missed = n, "Requester lagged, re-syncing snapshot");
                        if let Some(view) = dispatcher.get_task(task_id).await {
                            if let Ok(json) =
                                serde_json::to_string(&serde_json::json!({"snapshot": view}))
                            {
                                if socket.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    debug!(%task_id, "Requester subscription closed");
}
