//! HTTP server: REST façade, Prometheus exposition, and the `/ws/agent`
//! control plane.
//!
//! Every agent WebSocket is owned by exactly one connection task: inbound
//! frames and outbound commands are multiplexed through its select! loop,
//! so only that task ever writes to the socket. The registry reaches a
//! connection purely through its mpsc command channel.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dispatcher_proto::{
    decode_frame, AgentFrame, AgentState, CoordinatorFrame, Decoded, DispatchError, ErrorKind,
    RequestConfig,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::dispatch::{Dispatcher, JobOutcome, JobReply, PendingTable};
use crate::history::History;
use crate::metrics::Metrics;
use crate::pool::IpPool;
use crate::registry::{validate_agent_id, AgentRegistry};

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared handles behind every route.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CoordinatorConfig>,
    pub metrics: Arc<Metrics>,
    pub history: Arc<History>,
    pub pool: Arc<IpPool>,
    pub pending: Arc<PendingTable>,
    pub registry: Arc<AgentRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    /// Legacy singleton request template, in memory only.
    pub request_config: Arc<RwLock<Option<RequestConfig>>>,
}

impl AppState {
    /// Wire up the coordinator component graph.
    pub fn build(config: CoordinatorConfig) -> Self {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new());
        let history = Arc::new(History::new(config.history_capacity, config.history_body_cap));
        let pool = Arc::new(IpPool::new(config.fairness, Arc::clone(&metrics)));
        let pending = Arc::new(PendingTable::new());
        let registry = Arc::new(AgentRegistry::new(
            Arc::clone(&pool),
            Arc::clone(&pending),
            Arc::clone(&metrics),
            config.max_in_flight_per_agent,
            config.stale_after,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&pending),
            Arc::clone(&history),
            Arc::clone(&metrics),
            config.max_total_in_flight,
        ));
        Self {
            config,
            metrics,
            history,
            pool,
            pending,
            registry,
            dispatcher,
            request_config: Arc::new(RwLock::new(None)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/agents/register", post(register_agent))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{id}", delete(delete_agent))
        .route("/api/config/request", post(set_request_config).get(get_request_config))
        .route("/api/execute", post(execute_post).get(execute_get))
        .route("/api/pool/status", get(pool_status))
        .route("/api/stats", get(stats))
        .route("/api/history", get(history_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws/agent", get(ws_agent))
        .with_state(state)
}

/// Bind every configured listener, start the staleness reaper, and serve
/// until a server task fails.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let mut listeners = Vec::new();
    for addr in &state.config.listeners {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(addr = %addr, "listening");
        listeners.push(listener);
    }

    let _reaper = Arc::clone(&state.registry).spawn_reaper(state.config.heartbeat_interval / 3);

    let app = router(state);
    let mut servers = tokio::task::JoinSet::new();
    for listener in listeners {
        let app = app.clone();
        servers.spawn(async move { axum::serve(listener, app).await });
    }
    while let Some(result) = servers.join_next().await {
        result.context("server task panicked")??;
    }
    Ok(())
}

/// Taxonomy-to-status mapping for REST callers.
struct ApiError(DispatchError);

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NoAgentsAvailable
            | ErrorKind::AgentsSaturated
            | ErrorKind::CoordinatorOverloaded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };
        let body = json!({"error": self.0.kind, "message": self.0.message});
        (status, Json(body)).into_response()
    }
}

fn invalid(message: impl Into<String>) -> ApiError {
    ApiError(DispatchError::new(ErrorKind::InvalidRequest, message))
}

#[derive(Debug, Default, Deserialize)]
struct RegisterBody {
    #[serde(default)]
    agent_id: Option<String>,
}

/// HTTP pseudo-registration: validate or mint an agent id. Pool
/// membership only ever comes from live WebSocket sessions.
async fn register_agent(
    body: Result<Json<RegisterBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // An absent or empty body simply means "assign me an id".
    let requested = body.ok().and_then(|Json(b)| b.agent_id);
    let agent_id = match requested {
        Some(id) => {
            validate_agent_id(&id)?;
            id
        }
        None => {
            let hex = Uuid::new_v4().simple().to_string();
            format!("agent-{}", &hex[..8])
        }
    };
    Ok(Json(json!({"agent_id": agent_id})))
}

async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.snapshot())
}

#[derive(Debug, Default, Deserialize)]
struct DeleteParams {
    #[serde(default)]
    drain: bool,
}

async fn delete_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> impl IntoResponse {
    if params.drain {
        let draining = state.registry.drain(&agent_id).await;
        return Json(json!({"removed": false, "draining": draining}));
    }
    let removed = state.registry.remove_agent(&agent_id);
    Json(json!({"removed": removed}))
}

async fn set_request_config(
    State(state): State<AppState>,
    payload: Result<Json<RequestConfig>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(config) = payload.map_err(|e| invalid(e.body_text()))?;
    *state.request_config.write().unwrap() = Some(config);
    Ok(Json(json!({"ok": true})))
}

async fn get_request_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.request_config.read().unwrap().clone())
}

async fn execute_post(
    State(state): State<AppState>,
    payload: Result<Json<RequestConfig>, JsonRejection>,
) -> Result<Json<JobOutcome>, ApiError> {
    let Json(request) = payload.map_err(|e| invalid(e.body_text()))?;
    let outcome = state.dispatcher.submit(request).await?;
    Ok(Json(outcome))
}

/// Execute the stored request template.
async fn execute_get(State(state): State<AppState>) -> Result<Json<JobOutcome>, ApiError> {
    let stored = state.request_config.read().unwrap().clone();
    let request = stored.ok_or_else(|| invalid("no stored request config"))?;
    let outcome = state.dispatcher.submit(request).await?;
    Ok(Json(outcome))
}

async fn pool_status(State(state): State<AppState>) -> impl IntoResponse {
    let entries = state.pool.status();
    Json(json!({"size": entries.len(), "entries": entries}))
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    let agents: serde_json::Map<String, serde_json::Value> = snapshot
        .iter()
        .map(|agent| {
            (
                agent.agent_id.clone(),
                json!({
                    "hostname": agent.hostname,
                    "address_count": agent.addresses.len(),
                    "requests_processed": agent.requests_processed,
                    "in_flight": agent.in_flight,
                    "state": agent.state,
                }),
            )
        })
        .collect();
    Json(json!({
        "total_agents": snapshot.len(),
        "live_agents": snapshot.iter().filter(|a| a.state == AgentState::Live).count(),
        "total_ips": state.pool.size(),
        "total_requests": snapshot.iter().map(|a| a.requests_processed).sum::<u64>(),
        "in_flight": state.pending.len(),
        "history_entries": state.history.len(),
        "agents": agents,
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    100
}

async fn history_handler(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    Json(json!({"history": state.history.recent(params.limit)}))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn ws_agent(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| agent_connection(socket, state))
}

async fn agent_connection(socket: WebSocket, state: AppState) {
    state.metrics.websocket_connections.inc();
    run_agent_connection(socket, &state).await;
    state.metrics.websocket_connections.dec();
}

enum Flow {
    Continue,
    Close,
}

async fn run_agent_connection(socket: WebSocket, state: &AppState) {
    let (mut sink, mut stream) = socket.split();

    // The first frame must be `register`, promptly.
    let first = match tokio::time::timeout(REGISTER_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => decode_frame::<AgentFrame>(text.as_str()),
        Ok(Some(Err(e))) => {
            debug!(error = %e, "socket error before registration");
            return;
        }
        Ok(_) => {
            let _ = close_with(&mut sink, "expected register frame").await;
            return;
        }
        Err(_) => {
            let _ = close_with(&mut sink, "registration timeout").await;
            return;
        }
    };
    let (agent_id, hostname, addresses, agent_version) = match first {
        Decoded::Frame(AgentFrame::Register { agent_id, hostname, addresses, agent_version }) => {
            (agent_id, hostname, addresses, agent_version)
        }
        _ => {
            let _ = close_with(&mut sink, "first frame must be register").await;
            return;
        }
    };

    let (command_tx, mut command_rx) = mpsc::channel::<CoordinatorFrame>(64);
    let session = match state.registry.register(&agent_id, hostname, addresses, command_tx) {
        Ok(session) => session,
        Err(err) => {
            warn!(agent_id = %agent_id, error = %err, "registration rejected");
            let _ = close_with(&mut sink, &err.message).await;
            return;
        }
    };
    debug!(agent_id = %agent_id, version = %agent_version, session, "agent session open");

    let registered = CoordinatorFrame::Registered {
        assigned_agent_id: agent_id.clone(),
        server_time: unix_now(),
    };
    if send_frame(&mut sink, &registered).await.is_err() {
        state.registry.session_closed(&agent_id, session);
        return;
    }

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match decode_frame::<AgentFrame>(text.as_str()) {
                            Decoded::Frame(frame) => {
                                let flow =
                                    handle_agent_frame(state, &agent_id, session, frame, &mut sink)
                                        .await;
                                if matches!(flow, Flow::Close) {
                                    break;
                                }
                            }
                            Decoded::Unknown(t) => {
                                debug!(agent_id = %agent_id, frame_type = %t, "ignoring unknown frame");
                            }
                            Decoded::Malformed(e) => {
                                warn!(agent_id = %agent_id, error = %e, "malformed frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(agent_id = %agent_id, error = %e, "socket error");
                        break;
                    }
                }
            }
            cmd = command_rx.recv() => {
                match cmd {
                    Some(frame) => {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                    // The registry dropped our channel: replaced or removed.
                    None => break,
                }
            }
        }
    }

    let _ = sink.close().await;
    state.registry.session_closed(&agent_id, session);
}

async fn handle_agent_frame(
    state: &AppState,
    agent_id: &str,
    session: u64,
    frame: AgentFrame,
    sink: &mut SplitSink<WebSocket, Message>,
) -> Flow {
    match frame {
        AgentFrame::Heartbeat { addresses, ts: _ } => {
            if !state.registry.heartbeat(agent_id, session, addresses) {
                // Superseded session: let the replacement own the agent.
                return Flow::Close;
            }
            if send_frame(sink, &CoordinatorFrame::AckHeartbeat { ts: unix_now() })
                .await
                .is_err()
            {
                return Flow::Close;
            }
            Flow::Continue
        }
        AgentFrame::Result { job_id, status, response_headers, response_body_b64, elapsed_sec } => {
            let reply = match BASE64.decode(&response_body_b64) {
                Ok(body) => JobReply::Http { status, headers: response_headers, body, elapsed_sec },
                Err(e) => JobReply::Failed(DispatchError::new(
                    ErrorKind::ReadError,
                    format!("undecodable response body: {e}"),
                )),
            };
            if !state.pending.complete(job_id, reply) {
                debug!(agent_id = %agent_id, job_id = %job_id, "late result discarded");
            }
            Flow::Continue
        }
        AgentFrame::Error { job_id, kind, message } => {
            if !state
                .pending
                .complete(job_id, JobReply::Failed(DispatchError::new(kind, message)))
            {
                debug!(agent_id = %agent_id, job_id = %job_id, "late error discarded");
            }
            Flow::Continue
        }
        AgentFrame::Drained => {
            info!(agent_id = %agent_id, "agent drained");
            Flow::Close
        }
        AgentFrame::Register { .. } => {
            debug!(agent_id = %agent_id, "duplicate register frame ignored");
            Flow::Continue
        }
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &CoordinatorFrame,
) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(text) => sink.send(Message::Text(text.into())).await,
        Err(e) => {
            error!(error = %e, "frame serialization failed");
            Ok(())
        }
    }
}

async fn close_with(
    sink: &mut SplitSink<WebSocket, Message>,
    reason: &str,
) -> Result<(), axum::Error> {
    sink.send(Message::Close(Some(CloseFrame {
        code: close_code::POLICY,
        reason: reason.to_string().into(),
    })))
    .await
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
