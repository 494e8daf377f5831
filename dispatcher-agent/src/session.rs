//! Agent session: the WebSocket client side of the control plane.
//!
//! The session registers with the coordinator, heartbeats every interval
//! with a fresh address inventory, executes dispatched requests on worker
//! tasks bounded by a semaphore, and reconnects forever with jittered
//! exponential backoff. All outbound frames funnel through one mpsc
//! channel into the single select! loop that owns the socket sink.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dispatcher_proto::{
    decode_frame, AgentFrame, CoordinatorFrame, Decoded, DispatchError, ErrorKind,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::executor::{BoundExecutor, BoundRequest};
use crate::inventory;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const REGISTER_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables for one agent process.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub coordinator_url: String,
    pub agent_id: String,
    /// Fixed address set overriding the live inventory scan. Used by tests
    /// and deployments that pin their egress addresses.
    pub addresses: Option<Vec<String>>,
    pub heartbeat_interval: Duration,
    pub max_in_flight: usize,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
}

impl SessionConfig {
    pub fn new(coordinator_url: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            coordinator_url: coordinator_url.into(),
            agent_id: agent_id.into(),
            addresses: None,
            heartbeat_interval: Duration::from_secs(15),
            max_in_flight: 64,
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(60),
        }
    }
}

/// A connected (or reconnecting) agent.
pub struct AgentSession {
    config: SessionConfig,
    executor: Arc<BoundExecutor>,
    limiter: Arc<Semaphore>,
    hostname: String,
}

impl AgentSession {
    pub fn new(config: SessionConfig) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_in_flight));
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        Self { config, executor: Arc::new(BoundExecutor::new()), limiter, hostname }
    }

    /// Run the session, reconnecting indefinitely on transport failure.
    pub async fn run(&self) -> Result<()> {
        let url = websocket_url(&self.config.coordinator_url)
            .ok_or_else(|| Error::InvalidUrl(self.config.coordinator_url.clone()))?;
        let mut delay = self.config.reconnect_base;

        loop {
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => {
                    info!(url = %url, "connected to coordinator");
                    delay = self.config.reconnect_base;
                    match self.run_connection(stream).await {
                        Ok(()) => info!("session closed by coordinator"),
                        Err(Error::RegistrationRejected(reason)) => {
                            // A rejection is not transient; surface it.
                            return Err(Error::RegistrationRejected(reason));
                        }
                        Err(e) => warn!(error = %e, "session error"),
                    }
                }
                Err(e) => warn!(error = %e, "connection failed"),
            }

            let wait = jittered(delay);
            info!(delay_ms = wait.as_millis() as u64, "reconnecting");
            tokio::time::sleep(wait).await;
            delay = next_delay(delay, self.config.reconnect_cap);
        }
    }

    async fn run_connection(&self, stream: WsStream) -> Result<()> {
        let (mut sink, mut inbound) = stream.split();

        send_frame(
            &mut sink,
            &AgentFrame::Register {
                agent_id: self.config.agent_id.clone(),
                hostname: self.hostname.clone(),
                addresses: self.current_addresses(),
                agent_version: AGENT_VERSION.to_string(),
            },
        )
        .await?;

        let assigned_id = tokio::time::timeout(REGISTER_REPLY_TIMEOUT, async {
            loop {
                match inbound.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if let Decoded::Frame(CoordinatorFrame::Registered {
                            assigned_agent_id,
                            ..
                        }) = decode_frame::<CoordinatorFrame>(text.as_str())
                        {
                            return Ok(assigned_agent_id);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.as_str().to_string())
                            .unwrap_or_else(|| "closed during registration".to_string());
                        return Err(Error::RegistrationRejected(reason));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(Error::ConnectionClosed),
                }
            }
        })
        .await
        .map_err(|_| Error::RegistrationTimeout)??;

        if assigned_id != self.config.agent_id {
            warn!(
                requested = %self.config.agent_id,
                assigned = %assigned_id,
                "coordinator rewrote agent id"
            );
        }
        info!(agent_id = %assigned_id, "registered with coordinator");

        let (out_tx, mut out_rx) = mpsc::channel::<AgentFrame>(64);
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        let mut draining = false;

        loop {
            tokio::select! {
                msg = inbound.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match decode_frame::<CoordinatorFrame>(text.as_str()) {
                                Decoded::Frame(frame) => {
                                    self.handle_frame(frame, &out_tx, &mut draining).await;
                                }
                                Decoded::Unknown(t) => {
                                    debug!(frame_type = %t, "ignoring unknown frame");
                                }
                                Decoded::Malformed(e) => {
                                    warn!(error = %e, "malformed frame from coordinator");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                frame = out_rx.recv() => {
                    // The loop holds a sender, so recv() cannot yield None.
                    if let Some(frame) = frame {
                        send_frame(&mut sink, &frame).await?;
                    }
                }
                _ = heartbeat.tick() => {
                    send_frame(&mut sink, &AgentFrame::Heartbeat {
                        addresses: self.current_addresses(),
                        ts: unix_now(),
                    }).await?;
                }
            }

            if draining && self.limiter.available_permits() == self.config.max_in_flight {
                info!("drained, closing session");
                send_frame(&mut sink, &AgentFrame::Drained).await?;
                let _ = sink.close().await;
                return Ok(());
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: CoordinatorFrame,
        out_tx: &mpsc::Sender<AgentFrame>,
        draining: &mut bool,
    ) {
        match frame {
            CoordinatorFrame::Dispatch {
                job_id,
                source_ip,
                method,
                url,
                headers,
                body,
                timeout_sec,
            } => {
                if *draining {
                    let _ = out_tx
                        .send(AgentFrame::Error {
                            job_id,
                            kind: ErrorKind::Other,
                            message: "agent is draining".to_string(),
                        })
                        .await;
                    return;
                }
                let permit = match Arc::clone(&self.limiter).try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        warn!(job_id = %job_id, "dispatch beyond max_in_flight");
                        let _ = out_tx
                            .send(AgentFrame::Error {
                                job_id,
                                kind: ErrorKind::AgentsSaturated,
                                message: format!(
                                    "agent at max_in_flight ({})",
                                    self.config.max_in_flight
                                ),
                            })
                            .await;
                        return;
                    }
                };
                let request = BoundRequest {
                    source_ip,
                    method,
                    url,
                    headers,
                    body,
                    timeout: Duration::from_secs_f64(timeout_sec.max(0.0)),
                };
                let executor = Arc::clone(&self.executor);
                let out_tx = out_tx.clone();
                tokio::spawn(run_job(executor, permit, job_id, request, out_tx));
            }
            CoordinatorFrame::Drain => {
                info!("drain requested by coordinator");
                *draining = true;
            }
            CoordinatorFrame::AckHeartbeat { ts } => {
                debug!(ts, "heartbeat acknowledged");
            }
            CoordinatorFrame::Registered { .. } => {
                debug!("duplicate registered frame ignored");
            }
        }
    }

    fn current_addresses(&self) -> Vec<String> {
        match &self.config.addresses {
            Some(fixed) => fixed.clone(),
            None => inventory::scan(),
        }
    }
}

/// Execute one dispatched job and report the outcome.
///
/// The permit is released before the result frame is sent so the writer
/// loop observes a fully free limiter once the last result has been
/// written (the drain path depends on this ordering).
async fn run_job(
    executor: Arc<BoundExecutor>,
    permit: OwnedSemaphorePermit,
    job_id: Uuid,
    request: BoundRequest,
    out_tx: mpsc::Sender<AgentFrame>,
) {
    let outcome = executor.execute(request).await;
    drop(permit);
    let frame = match outcome {
        Ok(result) => AgentFrame::Result {
            job_id,
            status: result.status,
            response_headers: result.headers,
            response_body_b64: BASE64.encode(&result.body),
            elapsed_sec: result.elapsed.as_secs_f64(),
        },
        Err(DispatchError { kind, message }) => AgentFrame::Error { job_id, kind, message },
    };
    if out_tx.send(frame).await.is_err() {
        debug!(job_id = %job_id, "connection closed before result delivery");
    }
}

async fn send_frame(sink: &mut WsSink, frame: &AgentFrame) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Derive the agent control-plane URL from the coordinator base URL.
fn websocket_url(coordinator_url: &str) -> Option<String> {
    let base = coordinator_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return None;
    };
    Some(format!("{ws_base}/ws/agent"))
}

/// Exponential backoff step, capped.
fn next_delay(current: Duration, cap: Duration) -> Duration {
    (current * 2).min(cap)
}

/// Apply ±20% jitter.
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    delay.mul_f64(factor)
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_derivation() {
        assert_eq!(
            websocket_url("http://localhost:8000").as_deref(),
            Some("ws://localhost:8000/ws/agent")
        );
        assert_eq!(
            websocket_url("https://dispatch.example.com/").as_deref(),
            Some("wss://dispatch.example.com/ws/agent")
        );
        assert_eq!(
            websocket_url("ws://10.0.0.1:9000").as_deref(),
            Some("ws://10.0.0.1:9000/ws/agent")
        );
        assert!(websocket_url("ftp://nope").is_none());
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let cap = Duration::from_secs(60);
        let mut delay = Duration::from_secs(1);
        let mut observed = Vec::new();
        for _ in 0..8 {
            observed.push(delay.as_secs());
            delay = next_delay(delay, cap);
        }
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let j = jittered(base);
            assert!(j >= Duration::from_millis(7990), "{j:?} below -20%");
            assert!(j <= Duration::from_millis(12010), "{j:?} above +20%");
        }
    }
}
