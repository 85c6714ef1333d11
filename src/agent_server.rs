//! Agent-side WebSocket server: accepts a single coordinator connection at
//! `/ws`, performs the handshake, then services `ServerRequest` frames in a
//! strict request -> response loop for the lifetime of the socket.
//!
//! Grounded in the same upgrade/loop shape as a typical axum `ws` handler:
//! one task per connection, `WebSocketUpgrade::on_upgrade` into a socket
//! loop that matches incoming `Message` variants and exits cleanly on
//! `Message::Close` or a protocol violation.

use crate::engine::{self, AgentState};
use crate::error::WarpcoreError;
use crate::protocol::{AgentHello, AgentResponse, CoordinatorHello, ServerRequest, PROTOCOL_VERSION};
use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Top-level agent process state: the configured secret (rejecting any
/// coordinator that doesn't present it) and the id of whichever
/// coordinator currently has this agent claimed, since a single agent only
/// ever serves one coordinator at a time (spec §4.3). `None` means no
/// coordinator is attached (fresh process, or the prior one disconnected).
pub struct AgentServerState {
    pub secret: String,
    connected: Mutex<Option<String>>,
}

impl AgentServerState {
    pub fn new(secret: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            secret: secret.into(),
            connected: Mutex::new(None),
        })
    }
}

/// Outcome of checking an incoming `CoordinatorHello` against the agent's
/// `connected` record (spec §4.1).
enum Claim {
    /// No coordinator was attached (or the prior one disconnected); this
    /// session now owns the record.
    Fresh,
    /// The incoming id matches the currently attached coordinator; this is
    /// a reconnect of the same coordinator, not a new attach. Per spec §9
    /// open question, the prior socket's liveness is not verified here.
    Reattached,
    /// A different coordinator is already attached; reject.
    Conflict,
}

async fn try_claim(state: &AgentServerState, id: &str) -> Claim {
    let mut connected = state.connected.lock().await;
    match connected.as_deref() {
        None => {
            *connected = Some(id.to_string());
            Claim::Fresh
        }
        Some(current) if current == id => Claim::Reattached,
        Some(_) => Claim::Conflict,
    }
}

/// Clear the `connected` record, but only if it still names `id` — guards
/// against a stale session clearing a newer one that has since reattached
/// under the same coordinator id.
async fn release_claim(state: &AgentServerState, id: &str) {
    let mut connected = state.connected.lock().await;
    if connected.as_deref() == Some(id) {
        *connected = None;
    }
}

pub fn router(state: Arc<AgentServerState>) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AgentServerState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, server: Arc<AgentServerState>) {
    let hello = match recv_json::<CoordinatorHello>(&mut socket).await {
        Ok(Some(h)) => h,
        Ok(None) => return,
        Err(e) => {
            warn!(?e, "handshake failed to decode");
            return;
        }
    };

    if hello.id.is_empty() {
        warn!("handshake rejected: no server id sent");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: axum::extract::ws::close_code::PROTOCOL,
                reason: Cow::from("no server id sent"),
            })))
            .await;
        return;
    }

    if hello.version != PROTOCOL_VERSION {
        warn!(got = hello.version, want = PROTOCOL_VERSION, "protocol version mismatch");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: axum::extract::ws::close_code::PROTOCOL,
                reason: Cow::from(format!("protocol version mismatch: want {PROTOCOL_VERSION}")),
            })))
            .await;
        return;
    }
    if hello.secret != server.secret {
        warn!("handshake rejected: secret mismatch");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: axum::extract::ws::close_code::POLICY,
                reason: Cow::from("secret mismatch"),
            })))
            .await;
        return;
    }

    match try_claim(&server, &hello.id).await {
        Claim::Fresh => info!(coordinator_id = %hello.id, "coordinator attached"),
        Claim::Reattached => info!(coordinator_id = %hello.id, "coordinator reattached"),
        Claim::Conflict => {
            warn!(coordinator_id = %hello.id, "rejecting second coordinator connection");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: axum::extract::ws::close_code::PROTOCOL,
                    reason: Cow::from("another server already connected"),
                })))
                .await;
            return;
        }
    }

    if send_json(&mut socket, &AgentHello { time: chrono::Utc::now() }).await.is_err() {
        release_claim(&server, &hello.id).await;
        return;
    }

    info!(coordinator_id = %hello.id, "coordinator handshake accepted");
    let state = Arc::new(AgentState::new(hello.id.clone()));

    loop {
        let request = match recv_json::<ServerRequest>(&mut socket).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                info!("coordinator closed connection");
                break;
            }
            Err(e) => {
                error!(?e, "malformed request frame, closing connection");
                break;
            }
        };

        if matches!(request, ServerRequest::Disconnect) {
            info!("received disconnect, tearing down");
            state.stop_benchmark_stage().await;
            let _ = socket.send(Message::Close(None)).await;
            release_claim(&server, &hello.id).await;
            return;
        }

        let response = dispatch(&state, request).await;
        if send_json(&mut socket, &response).await.is_err() {
            break;
        }
    }

    // Socket dropped without an explicit `disconnect` (coordinator process
    // died, network partition). Clear the claim so a reconnecting
    // coordinator with the same id can reattach rather than being locked
    // out by a session that will never come back.
    release_claim(&server, &hello.id).await;
}

async fn dispatch(state: &Arc<AgentState>, request: ServerRequest) -> AgentResponse {
    match request {
        ServerRequest::Disconnect => unreachable!("handled by caller before dispatch"),
        ServerRequest::Benchmark { benchmark } => engine::handle_benchmark_request(state, &benchmark).await,
        ServerRequest::StartStage { stage, start_time } => {
            let err = match state.start_stage(stage, start_time).await {
                Ok(()) => String::new(),
                Err(e) => e.to_string(),
            };
            AgentResponse::BenchmarkStatus {
                time: chrono::Utc::now(),
                err,
                stage_info: state.stage_status(stage).await,
            }
        }
        ServerRequest::StageStatus { stage } => AgentResponse::BenchmarkStatus {
            time: chrono::Utc::now(),
            err: String::new(),
            stage_info: state.stage_status(stage).await,
        },
        ServerRequest::SendOps => AgentResponse::Ops {
            time: chrono::Utc::now(),
            err: String::new(),
            ops: state.ops().snapshot(),
            next_idx: None,
        },
        ServerRequest::SendOpsSince { idx } => {
            let snapshot = state.ops().snapshot();
            let next_idx = snapshot.len();
            let ops = snapshot.into_iter().skip(idx).collect();
            AgentResponse::Ops {
                time: chrono::Utc::now(),
                err: String::new(),
                ops,
                next_idx: Some(next_idx),
            }
        }
    }
}

async fn recv_json<T: serde::de::DeserializeOwned>(socket: &mut WebSocket) -> Result<Option<T>, WarpcoreError> {
    loop {
        let Some(msg) = socket.recv().await else {
            return Ok(None);
        };
        match msg {
            Ok(Message::Text(text)) => return Ok(Some(serde_json::from_str(&text)?)),
            Ok(Message::Close(_)) => return Ok(None),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Binary(_)) => {
                return Err(WarpcoreError::Protocol("unexpected binary frame".to_string()));
            }
            Err(e) => return Err(WarpcoreError::Transport(e.to_string())),
        }
    }
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), WarpcoreError> {
    let text = serde_json::to_string(value)?;
    socket
        .send(Message::Text(text))
        .await
        .map_err(|e| WarpcoreError::Transport(e.to_string()))
}
