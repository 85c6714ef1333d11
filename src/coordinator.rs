//! Coordinator-side connection pool and broadcast operations.
//!
//! Each `ConnectionSlot` owns one WebSocket connection to one agent and
//! performs the version/secret/clock handshake before the slot is usable.
//! The pool retries a failed initial connection up to
//! [`CONNECT_RETRY_ATTEMPTS`] times with a fixed backoff; once connected, an
//! RPC that hits a transport error gets exactly one reconnect attempt before
//! the call fails outright — matching the connection-level retry budget
//! described for the agent client in the coordination design. Every dial,
//! handshake, and steady-state RPC is bounded by a timeout so a hung or
//! half-open agent socket can't stall a broadcast round indefinitely.

use crate::clock::SyncClock;
use crate::error::{Result, WarpcoreError};
use crate::oplog::OpLog;
use crate::protocol::{AgentHello, AgentResponse, CoordinatorHello, ServerRequest, PROTOCOL_VERSION};
use crate::stage::Stage;
use chrono::{DateTime, Utc};
use futures_util::{future::join_all, SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

pub const CONNECT_RETRY_ATTEMPTS: u32 = 4;
pub const CONNECT_RETRY_BACKOFF: StdDuration = StdDuration::from_secs(1);

/// Socket dial bound. A `wss://` endpoint would add [`TLS_HANDSHAKE_TIMEOUT`]
/// on top of this for the TLS portion of the connect.
pub const DIAL_TIMEOUT: StdDuration = StdDuration::from_secs(10);
pub const TLS_HANDSHAKE_TIMEOUT: StdDuration = StdDuration::from_secs(15);
/// Bound on receiving the handshake reply once the socket is open.
pub const RESPONSE_HEADER_TIMEOUT: StdDuration = StdDuration::from_secs(120);
/// Bound on a single steady-state RPC round-trip once the connection is
/// established and past its handshake.
pub const IDLE_TIMEOUT: StdDuration = StdDuration::from_secs(90);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn timed_out(what: &str, bound: StdDuration) -> WarpcoreError {
    WarpcoreError::Transport(format!("{what} timed out after {bound:?}"))
}

/// One coordinator-held connection to one agent endpoint. Reconnecting
/// replaces the held stream in place so callers keep the same `ConnectionSlot`
/// across a transient failure.
pub struct ConnectionSlot {
    pub endpoint: String,
    coordinator_id: String,
    secret: String,
    stream: Mutex<Option<WsStream>>,
    pub clock: Mutex<Option<SyncClock>>,
    /// Set once this slot has taken a permanent RPC failure under
    /// `fail_on_error = false`; excluded slots are skipped by future
    /// broadcasts rather than retried forever.
    excluded: AtomicBool,
}

impl ConnectionSlot {
    /// Connect with bounded retries, performing the handshake on success.
    pub async fn connect(endpoint: impl Into<String>, coordinator_id: impl Into<String>, secret: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        let coordinator_id = coordinator_id.into();
        let secret = secret.into();

        let mut last_err = None;
        for attempt in 1..=CONNECT_RETRY_ATTEMPTS {
            match Self::dial_and_handshake(&endpoint, &coordinator_id, &secret).await {
                Ok((stream, clock)) => {
                    return Ok(Self {
                        endpoint,
                        coordinator_id,
                        secret,
                        stream: Mutex::new(Some(stream)),
                        clock: Mutex::new(Some(clock)),
                        excluded: AtomicBool::new(false),
                    });
                }
                Err(e) => {
                    warn!(%endpoint, attempt, error = %e, "connect attempt failed");
                    last_err = Some(e);
                    if attempt < CONNECT_RETRY_ATTEMPTS {
                        tokio::time::sleep(CONNECT_RETRY_BACKOFF).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| WarpcoreError::Transport(format!("unable to connect to {endpoint}"))))
    }

    pub fn is_excluded(&self) -> bool {
        self.excluded.load(Ordering::Acquire)
    }

    pub fn mark_excluded(&self) {
        self.excluded.store(true, Ordering::Release);
    }

    async fn dial_and_handshake(endpoint: &str, coordinator_id: &str, secret: &str) -> Result<(WsStream, SyncClock)> {
        let url = format!("ws://{endpoint}/ws");
        let (mut stream, _) = tokio::time::timeout(DIAL_TIMEOUT, tokio_tungstenite::connect_async(&url))
            .await
            .map_err(|_| timed_out(&format!("dial to {endpoint}"), DIAL_TIMEOUT))?
            .map_err(|e| WarpcoreError::Transport(e.to_string()))?;

        let handshake_time = Utc::now();
        let hello = CoordinatorHello {
            id: coordinator_id.to_string(),
            secret: secret.to_string(),
            version: PROTOCOL_VERSION,
        };
        tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, stream.send(Message::Text(serde_json::to_string(&hello)?)))
            .await
            .map_err(|_| timed_out("sending handshake hello", RESPONSE_HEADER_TIMEOUT))?
            .map_err(|e| WarpcoreError::Transport(e.to_string()))?;

        let reply = tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, stream.next())
            .await
            .map_err(|_| timed_out("awaiting handshake reply", RESPONSE_HEADER_TIMEOUT))?
            .ok_or_else(|| WarpcoreError::Protocol("agent closed connection during handshake".to_string()))?
            .map_err(|e| WarpcoreError::Transport(e.to_string()))?;

        let agent_hello: AgentHello = match reply {
            Message::Text(text) => serde_json::from_str(&text)?,
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(WarpcoreError::Protocol(format!("agent rejected handshake: {reason}")));
            }
            _ => return Err(WarpcoreError::Protocol("unexpected handshake reply frame".to_string())),
        };

        let clock = SyncClock::check_handshake(handshake_time, agent_hello.time)?;
        Ok((stream, clock))
    }

    /// Send one request and await its response, reconnecting exactly once
    /// on a transport-level failure before giving up.
    pub async fn rpc(&self, request: &ServerRequest) -> Result<AgentResponse> {
        match self.rpc_once(request).await {
            Ok(resp) => Ok(resp),
            Err(WarpcoreError::Transport(e)) => {
                warn!(endpoint = %self.endpoint, error = %e, "rpc failed, reconnecting once");
                self.reconnect().await?;
                self.rpc_once(request).await
            }
            Err(e) => Err(e),
        }
    }

    async fn rpc_once(&self, request: &ServerRequest) -> Result<AgentResponse> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| WarpcoreError::Transport("connection slot has no active stream".to_string()))?;

        tokio::time::timeout(IDLE_TIMEOUT, stream.send(Message::Text(serde_json::to_string(request)?)))
            .await
            .map_err(|_| timed_out(&format!("sending request to {}", self.endpoint), IDLE_TIMEOUT))?
            .map_err(|e| WarpcoreError::Transport(e.to_string()))?;

        let reply = tokio::time::timeout(IDLE_TIMEOUT, stream.next())
            .await
            .map_err(|_| timed_out(&format!("awaiting response from {}", self.endpoint), IDLE_TIMEOUT))?
            .ok_or_else(|| WarpcoreError::Transport("connection closed while awaiting response".to_string()))?
            .map_err(|e| WarpcoreError::Transport(e.to_string()))?;

        match reply {
            Message::Text(text) => Ok(serde_json::from_str(&text)?),
            Message::Close(_) => Err(WarpcoreError::Transport("agent closed connection".to_string())),
            _ => Err(WarpcoreError::Protocol("unexpected response frame".to_string())),
        }
    }

    async fn reconnect(&self) -> Result<()> {
        let (stream, clock) = Self::dial_and_handshake(&self.endpoint, &self.coordinator_id, &self.secret).await?;
        *self.stream.lock().await = Some(stream);
        *self.clock.lock().await = Some(clock);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut guard = self.stream.lock().await;
        if let Some(stream) = guard.as_mut() {
            let _ = stream.send(Message::Close(None)).await;
        }
        *guard = None;
    }
}

/// Owns every agent connection for one run and implements the
/// broadcast-style operations the coordinator drives: start a stage on
/// every agent, wait for every agent to report that stage finished,
/// download accumulated ops from every agent, and tear everything down.
pub struct CoordinatorClient {
    pub slots: Vec<ConnectionSlot>,
    pub fail_on_error: bool,
}

impl CoordinatorClient {
    pub async fn connect_all(endpoints: Vec<String>, coordinator_id: &str, secret: &str, fail_on_error: bool) -> Result<Self> {
        let mut slots = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            match ConnectionSlot::connect(endpoint.clone(), coordinator_id, secret).await {
                Ok(slot) => slots.push(slot),
                Err(e) if fail_on_error => return Err(e),
                Err(e) => warn!(%endpoint, error = %e, "agent unreachable, continuing without it"),
            }
        }
        if slots.is_empty() {
            return Err(WarpcoreError::Transport("no agents reachable".to_string()));
        }
        Ok(Self { slots, fail_on_error })
    }

    /// Send a request to every connected agent, one RPC per live slot fired
    /// concurrently so the round's total latency is one RTT rather than
    /// N×RTT. An individual agent's error is logged and recorded in the
    /// returned vector rather than aborting the whole broadcast; unless
    /// `fail_on_error` is set, a failing slot is also excluded from future
    /// broadcasts so a dead agent doesn't get retried on every subsequent
    /// round while the benchmark continues with its survivors.
    pub async fn broadcast(&self, request: ServerRequest) -> Vec<Result<AgentResponse>> {
        let futures = self.slots.iter().map(|slot| {
            let request = request.clone();
            async move {
                if slot.is_excluded() {
                    return Err(WarpcoreError::Transport(format!("{} excluded after a prior failure", slot.endpoint)));
                }
                slot.rpc(&request).await
            }
        });
        let results: Vec<Result<AgentResponse>> = join_all(futures).await;

        for (slot, result) in self.slots.iter().zip(results.iter()) {
            if let Err(e) = result {
                warn!(endpoint = %slot.endpoint, error = %e, "agent rpc failed");
                if !self.fail_on_error && !slot.is_excluded() {
                    warn!(endpoint = %slot.endpoint, "excluding agent from future broadcasts");
                    slot.mark_excluded();
                    slot.disconnect().await;
                }
            }
        }
        results
    }

    pub async fn start_stage_all(&self, stage: Stage, start_time: DateTime<Utc>) -> Vec<Result<AgentResponse>> {
        self.broadcast(ServerRequest::StartStage { stage, start_time }).await
    }

    /// Poll every agent's stage status until every reachable agent reports
    /// `finished`, sleeping `poll_interval` between rounds. Excluded slots
    /// always report (a synthetic) error, which counts as "finished" unless
    /// `fail_on_error` is set, so a dead agent can't block the wait forever.
    pub async fn wait_for_stage(&self, stage: Stage, poll_interval: StdDuration) -> Result<()> {
        loop {
            let statuses = self.broadcast(ServerRequest::StageStatus { stage }).await;
            let all_finished = statuses.iter().all(|r| match r {
                Ok(AgentResponse::BenchmarkStatus { stage_info, .. }) => stage_info.finished,
                Ok(_) => false,
                Err(_) => !self.fail_on_error,
            });
            if all_finished {
                return Ok(());
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Download every agent's full `OpLog` stream, in slot order (the order
    /// `rebase_thread_ids` expects), one RPC per live slot fired
    /// concurrently. Excluded slots contribute an empty stream.
    pub async fn download_ops(&self) -> Vec<Vec<OpLog>> {
        let futures = self.slots.iter().map(|slot| async move {
            if slot.is_excluded() {
                return Vec::new();
            }
            match slot.rpc(&ServerRequest::SendOps).await {
                Ok(AgentResponse::Ops { ops, .. }) => ops,
                Ok(_) => Vec::new(),
                Err(e) => {
                    warn!(endpoint = %slot.endpoint, error = %e, "failed to download ops");
                    Vec::new()
                }
            }
        });
        join_all(futures).await
    }

    /// Best-effort teardown: tell every agent to disconnect, ignoring
    /// individual failures since the run is ending regardless.
    pub async fn close_all(&self) {
        for slot in &self.slots {
            if slot.is_excluded() {
                continue;
            }
            let _ = slot.rpc(&ServerRequest::Disconnect).await;
            slot.disconnect().await;
        }
        info!("coordinator closed all agent connections");
    }
}
