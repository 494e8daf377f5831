//! Agent registry: identity, connection state, liveness.
//!
//! The registry owns the agent records; the pool only ever sees
//! `(agent_id, ip)` keys, so there is no reference cycle between the two.
//! Each WebSocket connection gets a monotonically increasing session
//! number, and every state change is gated on it, so a connection task that
//! lost a replacement race can never tear down its successor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dispatcher_proto::{AgentState, CoordinatorFrame, DispatchError, ErrorKind};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatch::PendingTable;
use crate::metrics::Metrics;
use crate::pool::IpPool;

pub const MAX_AGENT_ID_LEN: usize = 128;

struct Connection {
    session: u64,
    command_tx: mpsc::Sender<CoordinatorFrame>,
}

struct AgentEntry {
    hostname: String,
    state: AgentState,
    addresses: Vec<String>,
    connection: Option<Connection>,
    last_heartbeat: Instant,
    last_seen_at: DateTime<Utc>,
    registered_at: DateTime<Utc>,
    in_flight: usize,
    requests_processed: u64,
}

/// Point-in-time view of one agent for the REST API.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub hostname: String,
    pub addresses: Vec<String>,
    pub state: AgentState,
    pub last_seen: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub in_flight: usize,
    pub requests_processed: u64,
}

pub struct AgentRegistry {
    inner: Mutex<HashMap<String, AgentEntry>>,
    sessions: AtomicU64,
    pool: Arc<IpPool>,
    pending: Arc<PendingTable>,
    metrics: Arc<Metrics>,
    max_in_flight_per_agent: usize,
    stale_after: Duration,
}

impl AgentRegistry {
    pub fn new(
        pool: Arc<IpPool>,
        pending: Arc<PendingTable>,
        metrics: Arc<Metrics>,
        max_in_flight_per_agent: usize,
        stale_after: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            sessions: AtomicU64::new(0),
            pool,
            pending,
            metrics,
            max_in_flight_per_agent,
            stale_after,
        }
    }

    /// Register a new WebSocket session. If the id is already held by a
    /// live session, that session is replaced: its command channel is
    /// dropped (which closes its socket loop) and its pending jobs fail
    /// with `AgentReplaced`.
    ///
    /// Returns the session number the connection must present on
    /// subsequent registry calls.
    pub fn register(
        &self,
        agent_id: &str,
        hostname: String,
        addresses: Vec<String>,
        command_tx: mpsc::Sender<CoordinatorFrame>,
    ) -> Result<u64, DispatchError> {
        validate_agent_id(agent_id)?;
        if addresses.is_empty() {
            return Err(DispatchError::new(
                ErrorKind::InvalidRequest,
                "registration with no usable addresses",
            ));
        }

        let session = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Utc::now();
        let replaced = {
            let mut agents = self.inner.lock().unwrap();
            match agents.get_mut(agent_id) {
                Some(entry) => {
                    let had_connection = entry.connection.is_some();
                    entry.connection = Some(Connection { session, command_tx });
                    entry.state = AgentState::Live;
                    entry.hostname = hostname.clone();
                    entry.addresses = addresses.clone();
                    entry.last_heartbeat = Instant::now();
                    entry.last_seen_at = now;
                    entry.registered_at = now;
                    had_connection
                }
                None => {
                    agents.insert(
                        agent_id.to_string(),
                        AgentEntry {
                            hostname: hostname.clone(),
                            state: AgentState::Live,
                            addresses: addresses.clone(),
                            connection: Some(Connection { session, command_tx }),
                            last_heartbeat: Instant::now(),
                            last_seen_at: now,
                            registered_at: now,
                            in_flight: 0,
                            requests_processed: 0,
                        },
                    );
                    false
                }
            }
        };

        if replaced {
            warn!(agent_id = %agent_id, "agent replaced by a new session");
            self.pending.fail_agent(
                agent_id,
                ErrorKind::AgentReplaced,
                "agent re-registered from a new connection",
            );
        }
        self.pool.update(agent_id, &addresses);
        self.refresh_gauges();
        info!(
            agent_id = %agent_id,
            hostname = %hostname,
            addresses = addresses.len(),
            session,
            "agent registered"
        );
        Ok(session)
    }

    /// Apply a heartbeat from session `session`. Returns false for a
    /// stale or unknown session, in which case the caller should drop the
    /// connection.
    pub fn heartbeat(&self, agent_id: &str, session: u64, addresses: Vec<String>) -> bool {
        let state = {
            let mut agents = self.inner.lock().unwrap();
            match agents.get_mut(agent_id) {
                Some(entry)
                    if entry.connection.as_ref().is_some_and(|c| c.session == session) =>
                {
                    entry.last_heartbeat = Instant::now();
                    entry.last_seen_at = Utc::now();
                    entry.addresses = addresses.clone();
                    Some(entry.state)
                }
                _ => None,
            }
        };
        match state {
            Some(AgentState::Live) => {
                self.pool.update(agent_id, &addresses);
                true
            }
            // Draining agents heartbeat until their jobs finish but never
            // re-enter the pool.
            Some(_) => true,
            None => false,
        }
    }

    /// Called by a connection task when its socket closes. A no-op if the
    /// session has already been replaced or removed.
    pub fn session_closed(&self, agent_id: &str, session: u64) {
        let was_current = {
            let mut agents = self.inner.lock().unwrap();
            match agents.get_mut(agent_id) {
                Some(entry)
                    if entry.connection.as_ref().is_some_and(|c| c.session == session) =>
                {
                    entry.connection = None;
                    entry.state = AgentState::Dead;
                    true
                }
                _ => false,
            }
        };
        if was_current {
            info!(agent_id = %agent_id, session, "agent disconnected");
            self.pool.remove(agent_id);
            self.pending
                .fail_agent(agent_id, ErrorKind::AgentLost, "agent disconnected");
            self.refresh_gauges();
        } else {
            debug!(agent_id = %agent_id, session, "stale session closed");
        }
    }

    /// Declare agents that stopped heartbeating `Dead` and fail their
    /// pending jobs. Returns the ids that were reaped.
    pub fn remove_stale(&self) -> Vec<String> {
        let stale: Vec<String> = {
            let mut agents = self.inner.lock().unwrap();
            agents
                .iter_mut()
                .filter(|(_, entry)| {
                    matches!(entry.state, AgentState::Live | AgentState::Draining)
                        && entry.last_heartbeat.elapsed() > self.stale_after
                })
                .map(|(id, entry)| {
                    entry.connection = None;
                    entry.state = AgentState::Dead;
                    id.clone()
                })
                .collect()
        };
        for agent_id in &stale {
            warn!(agent_id = %agent_id, "agent declared dead: heartbeat timeout");
            self.pool.remove(agent_id);
            self.pending
                .fail_agent(agent_id, ErrorKind::AgentLost, "heartbeat timeout");
        }
        if !stale.is_empty() {
            self.refresh_gauges();
        }
        stale
    }

    /// Background staleness reaper.
    pub fn spawn_reaper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.remove_stale();
            }
        })
    }

    /// Remove an agent outright (operator action). Dropping its command
    /// channel closes the socket loop.
    pub fn remove_agent(&self, agent_id: &str) -> bool {
        let existed = self.inner.lock().unwrap().remove(agent_id).is_some();
        if existed {
            info!(agent_id = %agent_id, "agent removed");
            self.pool.remove(agent_id);
            self.pending
                .fail_agent(agent_id, ErrorKind::AgentLost, "agent removed by operator");
            self.refresh_gauges();
        }
        existed
    }

    /// Ask an agent to drain: it leaves the pool immediately, keeps its
    /// in-flight jobs, and will reply `drained` when they finish.
    pub async fn drain(&self, agent_id: &str) -> bool {
        let tx = {
            let mut agents = self.inner.lock().unwrap();
            match agents.get_mut(agent_id) {
                Some(entry) if entry.connection.is_some() => {
                    entry.state = AgentState::Draining;
                    entry.connection.as_ref().map(|c| c.command_tx.clone())
                }
                _ => None,
            }
        };
        match tx {
            Some(tx) => {
                info!(agent_id = %agent_id, "draining agent");
                self.pool.remove(agent_id);
                self.refresh_gauges();
                tx.send(CoordinatorFrame::Drain).await.is_ok()
            }
            None => false,
        }
    }

    /// Drain every connected agent (graceful coordinator shutdown).
    pub async fn drain_all(&self) {
        let ids: Vec<String> = {
            let agents = self.inner.lock().unwrap();
            agents
                .iter()
                .filter(|(_, e)| e.connection.is_some())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.drain(&id).await;
        }
    }

    /// Forward a frame to an agent's connection writer.
    pub async fn send(&self, agent_id: &str, frame: CoordinatorFrame) -> Result<(), DispatchError> {
        let tx = {
            let agents = self.inner.lock().unwrap();
            agents
                .get(agent_id)
                .and_then(|e| e.connection.as_ref())
                .map(|c| c.command_tx.clone())
        }
        .ok_or_else(|| {
            DispatchError::new(
                ErrorKind::AgentLost,
                format!("agent {agent_id} has no live session"),
            )
        })?;
        tx.send(frame).await.map_err(|_| {
            DispatchError::new(
                ErrorKind::AgentLost,
                format!("agent {agent_id} connection closed"),
            )
        })
    }

    /// Reserve one in-flight slot on a live agent.
    pub fn try_reserve(&self, agent_id: &str) -> bool {
        let mut agents = self.inner.lock().unwrap();
        match agents.get_mut(agent_id) {
            Some(entry)
                if entry.state == AgentState::Live
                    && entry.connection.is_some()
                    && entry.in_flight < self.max_in_flight_per_agent =>
            {
                entry.in_flight += 1;
                self.metrics
                    .queue_depth
                    .with_label_values(&[agent_id])
                    .set(entry.in_flight as i64);
                true
            }
            _ => false,
        }
    }

    /// Release an in-flight slot. `processed` marks jobs that reached a
    /// terminal state through the normal resolution path.
    pub fn release(&self, agent_id: &str, processed: bool) {
        let mut agents = self.inner.lock().unwrap();
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            if processed {
                entry.requests_processed += 1;
            }
            self.metrics
                .queue_depth
                .with_label_values(&[agent_id])
                .set(entry.in_flight as i64);
        }
    }

    /// All agents, sorted by id.
    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        let agents = self.inner.lock().unwrap();
        let mut list: Vec<AgentSnapshot> = agents
            .iter()
            .map(|(id, e)| AgentSnapshot {
                agent_id: id.clone(),
                hostname: e.hostname.clone(),
                addresses: e.addresses.clone(),
                state: e.state,
                last_seen: e.last_seen_at,
                registered_at: e.registered_at,
                in_flight: e.in_flight,
                requests_processed: e.requests_processed,
            })
            .collect();
        list.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        list
    }

    /// `(total, connected)` agent counts.
    pub fn counts(&self) -> (usize, usize) {
        let agents = self.inner.lock().unwrap();
        let connected = agents.values().filter(|e| e.connection.is_some()).count();
        (agents.len(), connected)
    }

    fn refresh_gauges(&self) {
        let (total, connected) = self.counts();
        self.metrics.agents_total.set(total as i64);
        self.metrics.agents_connected.set(connected as i64);
    }
}

/// Agent ids are opaque but bounded: non-empty, at most 128 bytes, and
/// printable without whitespace so they can travel in logs and labels.
pub fn validate_agent_id(agent_id: &str) -> Result<(), DispatchError> {
    if agent_id.is_empty() {
        return Err(DispatchError::new(ErrorKind::InvalidRequest, "agent_id must not be empty"));
    }
    if agent_id.len() > MAX_AGENT_ID_LEN {
        return Err(DispatchError::new(
            ErrorKind::InvalidRequest,
            format!("agent_id exceeds {MAX_AGENT_ID_LEN} characters"),
        ));
    }
    if !agent_id.chars().all(|c| c.is_ascii_graphic()) {
        return Err(DispatchError::new(
            ErrorKind::InvalidRequest,
            "agent_id must be printable without whitespace",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Fairness;
    use uuid::Uuid;

    fn fixture() -> (Arc<AgentRegistry>, Arc<IpPool>, Arc<PendingTable>) {
        let metrics = Arc::new(Metrics::new());
        let pool = Arc::new(IpPool::new(Fairness::PerIp, Arc::clone(&metrics)));
        let pending = Arc::new(PendingTable::new());
        let registry = Arc::new(AgentRegistry::new(
            Arc::clone(&pool),
            Arc::clone(&pending),
            metrics,
            2,
            Duration::from_secs(45),
        ));
        (registry, pool, pending)
    }

    #[test]
    fn id_validation() {
        assert!(validate_agent_id("agent-1").is_ok());
        assert!(validate_agent_id("").is_err());
        assert!(validate_agent_id("has space").is_err());
        assert!(validate_agent_id(&"x".repeat(129)).is_err());
        assert!(validate_agent_id(&"x".repeat(128)).is_ok());
    }

    #[tokio::test]
    async fn register_populates_pool() {
        let (registry, pool, _) = fixture();
        let (tx, _rx) = mpsc::channel(8);
        registry
            .register("a1", "host".into(), vec!["10.0.0.1".into(), "10.0.0.2".into()], tx)
            .unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(registry.counts(), (1, 1));
    }

    #[tokio::test]
    async fn zero_address_registration_is_rejected() {
        let (registry, pool, _) = fixture();
        let (tx, _rx) = mpsc::channel(8);
        let err = registry.register("a1", "host".into(), vec![], tx).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        assert_eq!(pool.size(), 0);
        assert_eq!(registry.counts(), (0, 0));
    }

    #[tokio::test]
    async fn replacement_fails_prior_pending_jobs() {
        let (registry, pool, pending) = fixture();
        let (tx1, _rx1) = mpsc::channel(8);
        registry.register("a1", "host".into(), vec!["a".into()], tx1).unwrap();

        let job = Uuid::new_v4();
        let rx = pending.insert(job, "a1", 100).unwrap();

        // Second connection under the same id takes over with new addresses.
        let (tx2, _rx2) = mpsc::channel(8);
        registry.register("a1", "host".into(), vec!["b".into()], tx2).unwrap();

        let reply = rx.await.unwrap();
        match reply {
            crate::dispatch::JobReply::Failed(err) => {
                assert_eq!(err.kind, ErrorKind::AgentReplaced)
            }
            other => panic!("expected failure, got {other:?}"),
        }
        // Pool holds the newly reported set, not the stale one.
        let ips: Vec<String> = pool.status().into_iter().map(|e| e.ip).collect();
        assert_eq!(ips, vec!["b"]);
        assert_eq!(registry.counts(), (1, 1));
    }

    #[tokio::test]
    async fn session_closed_only_affects_current_session() {
        let (registry, pool, _) = fixture();
        let (tx1, _rx1) = mpsc::channel(8);
        let first = registry.register("a1", "h".into(), vec!["a".into()], tx1).unwrap();
        let (tx2, _rx2) = mpsc::channel(8);
        let _second = registry.register("a1", "h".into(), vec!["b".into()], tx2).unwrap();

        // The replaced connection noticing its closure must not touch the
        // new session's pool entries.
        registry.session_closed("a1", first);
        assert_eq!(pool.size(), 1);
        assert_eq!(registry.counts().1, 1);
    }

    #[tokio::test]
    async fn disconnect_clears_pool_and_pending() {
        let (registry, pool, pending) = fixture();
        let (tx, _rx) = mpsc::channel(8);
        let session = registry.register("a1", "h".into(), vec!["a".into()], tx).unwrap();
        let job = Uuid::new_v4();
        let rx = pending.insert(job, "a1", 100).unwrap();

        registry.session_closed("a1", session);
        assert_eq!(pool.size(), 0);
        match rx.await.unwrap() {
            crate::dispatch::JobReply::Failed(err) => assert_eq!(err.kind, ErrorKind::AgentLost),
            other => panic!("expected AgentLost, got {other:?}"),
        }
        // The record survives as Dead for diagnostics.
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].state, AgentState::Dead);
    }

    #[tokio::test]
    async fn heartbeat_diffs_pool_membership() {
        let (registry, pool, _) = fixture();
        let (tx, _rx) = mpsc::channel(8);
        let session =
            registry.register("a1", "h".into(), vec!["a".into(), "b".into()], tx).unwrap();

        assert!(registry.heartbeat("a1", session, vec!["b".into(), "c".into()]));
        let ips: Vec<String> = pool.status().into_iter().map(|e| e.ip).collect();
        assert_eq!(ips, vec!["b", "c"]);

        // A heartbeat from a superseded session is refused.
        assert!(!registry.heartbeat("a1", session + 7, vec!["z".into()]));
    }

    #[tokio::test]
    async fn in_flight_slots_are_capped() {
        let (registry, _, _) = fixture();
        let (tx, _rx) = mpsc::channel(8);
        registry.register("a1", "h".into(), vec!["a".into()], tx).unwrap();
        assert!(registry.try_reserve("a1"));
        assert!(registry.try_reserve("a1"));
        assert!(!registry.try_reserve("a1")); // max_in_flight_per_agent = 2
        registry.release("a1", true);
        assert!(registry.try_reserve("a1"));
        assert!(!registry.try_reserve("missing"));
    }

    #[tokio::test]
    async fn stale_agents_are_reaped() {
        let metrics = Arc::new(Metrics::new());
        let pool = Arc::new(IpPool::new(Fairness::PerIp, Arc::clone(&metrics)));
        let pending = Arc::new(PendingTable::new());
        let registry = AgentRegistry::new(
            Arc::clone(&pool),
            Arc::clone(&pending),
            metrics,
            2,
            Duration::ZERO,
        );
        let (tx, _rx) = mpsc::channel(8);
        registry.register("a1", "h".into(), vec!["a".into()], tx).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let reaped = registry.remove_stale();
        assert_eq!(reaped, vec!["a1".to_string()]);
        assert_eq!(pool.size(), 0);
        assert_eq!(registry.snapshot()[0].state, AgentState::Dead);
        // Reaping is idempotent.
        assert!(registry.remove_stale().is_empty());
    }

    #[tokio::test]
    async fn drain_removes_from_pool_but_keeps_session() {
        let (registry, pool, _) = fixture();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register("a1", "h".into(), vec!["a".into()], tx).unwrap();

        assert!(registry.drain("a1").await);
        assert_eq!(pool.size(), 0);
        assert_eq!(registry.counts(), (1, 1));
        assert!(matches!(rx.recv().await, Some(CoordinatorFrame::Drain)));
        // Draining agents take no new work.
        assert!(!registry.try_reserve("a1"));
    }
}
