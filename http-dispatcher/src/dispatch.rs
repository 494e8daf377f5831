//! Job dispatch: submit pipeline, pending table, timeouts, cancellation.
//!
//! `job_id` is the sole correlation key between a dispatched request and
//! the agent's eventual reply. A pending-table entry exists exactly while
//! a job is assigned or in flight; a reply for a job with no entry is late
//! and is logged and discarded; it can never double-complete a job or
//! touch history and metrics again.
//!
//! The dispatcher never retries: every failure surfaces to the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dispatcher_proto::{
    CoordinatorFrame, DispatchError, ErrorKind, HttpMethod, RequestConfig,
};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::history::{History, HistoryEntry};
use crate::metrics::Metrics;
use crate::pool::IpPool;
use crate::registry::AgentRegistry;

/// Terminal reply delivered through a pending-table entry.
#[derive(Debug)]
pub enum JobReply {
    /// The agent returned an HTTP response.
    Http {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        elapsed_sec: f64,
    },
    /// The job failed, agent-side or coordinator-side.
    Failed(DispatchError),
}

struct Pending {
    agent_id: String,
    tx: oneshot::Sender<JobReply>,
}

/// Correlation table for jobs awaiting an agent reply or deadline.
///
/// One entry exists iff the job is in `Assigned` or `InFlight`; the map
/// size is therefore the coordinator-wide in-flight count.
pub struct PendingTable {
    inner: Mutex<HashMap<Uuid, Pending>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    /// Register a job, enforcing the global in-flight cap atomically.
    pub fn insert(
        &self,
        job_id: Uuid,
        agent_id: &str,
        max_total: usize,
    ) -> Result<oneshot::Receiver<JobReply>, DispatchError> {
        let mut table = self.inner.lock().unwrap();
        if table.len() >= max_total {
            return Err(DispatchError::new(
                ErrorKind::CoordinatorOverloaded,
                format!("{max_total} jobs already in flight"),
            ));
        }
        let (tx, rx) = oneshot::channel();
        table.insert(job_id, Pending { agent_id: agent_id.to_string(), tx });
        Ok(rx)
    }

    /// Resolve a job with an agent reply. Returns false when the job is
    /// unknown or already resolved, in which case the caller logs and
    /// discards it.
    pub fn complete(&self, job_id: Uuid, reply: JobReply) -> bool {
        let entry = self.inner.lock().unwrap().remove(&job_id);
        match entry {
            Some(pending) => pending.tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop a job's entry without resolving it (timeout or cancellation
    /// paths, where the waiter is the one going away).
    pub fn remove(&self, job_id: Uuid) -> bool {
        self.inner.lock().unwrap().remove(&job_id).is_some()
    }

    /// Fail every pending job assigned to `agent_id`. Returns how many
    /// jobs were failed.
    pub fn fail_agent(&self, agent_id: &str, kind: ErrorKind, message: &str) -> usize {
        let failed: Vec<Pending> = {
            let mut table = self.inner.lock().unwrap();
            let ids: Vec<Uuid> = table
                .iter()
                .filter(|(_, p)| p.agent_id == agent_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| table.remove(&id)).collect()
        };
        let count = failed.len();
        for pending in failed {
            let _ = pending
                .tx
                .send(JobReply::Failed(DispatchError::new(kind, message)));
        }
        if count > 0 {
            info!(agent_id = %agent_id, jobs = count, kind = %kind, "failed pending jobs");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Successful job resolution as returned to the REST caller.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub agent_id: String,
    pub source_ip: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub elapsed_sec: f64,
}

pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
    pool: Arc<IpPool>,
    pending: Arc<PendingTable>,
    history: Arc<History>,
    metrics: Arc<Metrics>,
    max_total_in_flight: usize,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<AgentRegistry>,
        pool: Arc<IpPool>,
        pending: Arc<PendingTable>,
        history: Arc<History>,
        metrics: Arc<Metrics>,
        max_total_in_flight: usize,
    ) -> Self {
        Self { registry, pool, pending, history, metrics, max_total_in_flight }
    }

    /// Dispatch one request and await its terminal state.
    ///
    /// If the caller drops this future before resolution (the REST client
    /// disconnected), the job is finalized as `Cancelled` and any later
    /// agent reply is discarded.
    pub async fn submit(&self, request: RequestConfig) -> Result<JobOutcome, DispatchError> {
        let request = validate(request)?;
        let job_id = Uuid::new_v4();
        let submitted_at = Utc::now();
        let started = Instant::now();
        let timeout = Duration::from_secs_f64(request.timeout);

        let (agent_id, source_ip) = match self.pick_with_capacity() {
            Ok(pair) => pair,
            Err(err) => {
                self.metrics.record_failed("", err.kind.as_str(), request.method.as_str(), 0.0);
                self.history.record(HistoryEntry {
                    job_id,
                    method: request.method,
                    url: request.url.clone(),
                    status: None,
                    error: Some(err.kind),
                    agent_id: None,
                    source_ip: None,
                    latency_sec: 0.0,
                    submitted_at,
                    completed_at: Utc::now(),
                    body: None,
                });
                warn!(job_id = %job_id, kind = %err.kind, "job rejected before assignment");
                return Err(err);
            }
        };

        let rx = match self.pending.insert(job_id, &agent_id, self.max_total_in_flight) {
            Ok(rx) => rx,
            Err(err) => {
                self.registry.release(&agent_id, false);
                self.metrics.record_failed("", err.kind.as_str(), request.method.as_str(), 0.0);
                warn!(job_id = %job_id, "coordinator overloaded");
                return Err(err);
            }
        };

        let job = InFlight {
            dispatcher: self,
            job_id,
            agent_id,
            source_ip,
            method: request.method,
            url: request.url.clone(),
            submitted_at,
            started,
            done: false,
        };

        let frame = CoordinatorFrame::Dispatch {
            job_id,
            source_ip: job.source_ip.clone(),
            method: request.method,
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            timeout_sec: request.timeout,
        };
        if let Err(err) = self.registry.send(&job.agent_id, frame).await {
            return Err(job.fail(err));
        }
        self.pool.mark_used(&job.agent_id, &job.source_ip);
        debug!(
            job_id = %job_id,
            agent_id = %job.agent_id,
            source_ip = %job.source_ip,
            "job dispatched"
        );

        // The coordinator's own clock enforces the deadline; the agent's
        // timeout is only a secondary bound.
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(JobReply::Http { status, headers, body, elapsed_sec })) => {
                Ok(job.complete(status, headers, body, elapsed_sec))
            }
            Ok(Ok(JobReply::Failed(err))) => Err(job.fail(err)),
            Ok(Err(_)) => Err(job.fail(DispatchError::new(
                ErrorKind::AgentLost,
                "completion channel dropped",
            ))),
            Err(_) => Err(job.fail(DispatchError::new(
                ErrorKind::Timeout,
                format!("no reply within {}s", request.timeout),
            ))),
        }
    }

    /// Pick a pool entry whose agent is live and below its in-flight cap,
    /// re-picking at most pool-size times.
    fn pick_with_capacity(&self) -> Result<(String, String), DispatchError> {
        let attempts = self.pool.size().max(1);
        let mut saw_entry = false;
        for _ in 0..attempts {
            match self.pool.pick() {
                None => break,
                Some((agent_id, ip)) => {
                    saw_entry = true;
                    if self.registry.try_reserve(&agent_id) {
                        return Ok((agent_id, ip));
                    }
                }
            }
        }
        if saw_entry {
            Err(DispatchError::new(
                ErrorKind::AgentsSaturated,
                "all candidate agents at max_in_flight",
            ))
        } else {
            Err(DispatchError::new(ErrorKind::NoAgentsAvailable, "source-ip pool is empty"))
        }
    }
}

/// Exactly-once finalization for a job that reached the pending table.
///
/// `complete`/`fail` resolve it normally; dropping it unresolved is the
/// caller-disconnect path and finalizes as `Cancelled`.
struct InFlight<'a> {
    dispatcher: &'a Dispatcher,
    job_id: Uuid,
    agent_id: String,
    source_ip: String,
    method: HttpMethod,
    url: String,
    submitted_at: DateTime<Utc>,
    started: Instant,
    done: bool,
}

impl InFlight<'_> {
    fn complete(
        mut self,
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        elapsed_sec: f64,
    ) -> JobOutcome {
        self.done = true;
        let d = self.dispatcher;
        d.pending.remove(self.job_id);
        d.registry.release(&self.agent_id, true);
        let latency = self.started.elapsed().as_secs_f64();
        d.metrics.record_completed(
            &self.agent_id,
            status,
            self.method.as_str(),
            latency,
            body.len(),
        );
        let body_text = String::from_utf8_lossy(&body).into_owned();
        d.history.record(HistoryEntry {
            job_id: self.job_id,
            method: self.method,
            url: self.url.clone(),
            status: Some(status),
            error: None,
            agent_id: Some(self.agent_id.clone()),
            source_ip: Some(self.source_ip.clone()),
            latency_sec: latency,
            submitted_at: self.submitted_at,
            completed_at: Utc::now(),
            body: Some(body_text.clone()),
        });
        info!(
            job_id = %self.job_id,
            agent_id = %self.agent_id,
            status,
            latency_sec = latency,
            "job completed"
        );
        JobOutcome {
            job_id: self.job_id,
            agent_id: self.agent_id.clone(),
            source_ip: self.source_ip.clone(),
            status,
            headers,
            body: body_text,
            elapsed_sec,
        }
    }

    fn fail(mut self, err: DispatchError) -> DispatchError {
        self.done = true;
        let d = self.dispatcher;
        d.pending.remove(self.job_id);
        d.registry.release(&self.agent_id, true);
        let latency = self.started.elapsed().as_secs_f64();
        d.metrics.record_failed(&self.agent_id, err.kind.as_str(), self.method.as_str(), latency);
        d.history.record(HistoryEntry {
            job_id: self.job_id,
            method: self.method,
            url: self.url.clone(),
            status: None,
            error: Some(err.kind),
            agent_id: Some(self.agent_id.clone()),
            source_ip: Some(self.source_ip.clone()),
            latency_sec: latency,
            submitted_at: self.submitted_at,
            completed_at: Utc::now(),
            body: None,
        });
        warn!(
            job_id = %self.job_id,
            agent_id = %self.agent_id,
            kind = %err.kind,
            latency_sec = latency,
            "job failed"
        );
        err
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let d = self.dispatcher;
        d.pending.remove(self.job_id);
        d.registry.release(&self.agent_id, false);
        d.metrics.record_failed(
            &self.agent_id,
            ErrorKind::Cancelled.as_str(),
            self.method.as_str(),
            self.started.elapsed().as_secs_f64(),
        );
        d.history.record(HistoryEntry {
            job_id: self.job_id,
            method: self.method,
            url: self.url.clone(),
            status: None,
            error: Some(ErrorKind::Cancelled),
            agent_id: Some(self.agent_id.clone()),
            source_ip: Some(self.source_ip.clone()),
            latency_sec: self.started.elapsed().as_secs_f64(),
            submitted_at: self.submitted_at,
            completed_at: Utc::now(),
            body: None,
        });
        info!(job_id = %self.job_id, "job cancelled by caller");
    }
}

/// Reject bad input before any pool pick, and fold `params` into the URL.
fn validate(mut request: RequestConfig) -> Result<RequestConfig, DispatchError> {
    if !request.timeout.is_finite() || request.timeout <= 0.0 {
        return Err(DispatchError::new(
            ErrorKind::InvalidRequest,
            format!("timeout must be positive, got {}", request.timeout),
        ));
    }
    let mut parsed = url::Url::parse(&request.url)
        .map_err(|e| DispatchError::new(ErrorKind::InvalidRequest, format!("invalid url: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(DispatchError::new(
                ErrorKind::InvalidRequest,
                format!("unsupported scheme: {other}"),
            ));
        }
    }
    if let Some(params) = request.params.take() {
        parsed.query_pairs_mut().extend_pairs(params.iter());
        request.url = parsed.into();
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Fairness;
    use tokio::sync::mpsc;

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        registry: Arc<AgentRegistry>,
        pending: Arc<PendingTable>,
        pool: Arc<IpPool>,
        history: Arc<History>,
        metrics: Arc<Metrics>,
    }

    fn fixture(max_per_agent: usize, max_total: usize) -> Fixture {
        let metrics = Arc::new(Metrics::new());
        let pool = Arc::new(IpPool::new(Fairness::PerIp, Arc::clone(&metrics)));
        let pending = Arc::new(PendingTable::new());
        let history = Arc::new(History::new(100, 65536));
        let registry = Arc::new(AgentRegistry::new(
            Arc::clone(&pool),
            Arc::clone(&pending),
            Arc::clone(&metrics),
            max_per_agent,
            Duration::from_secs(45),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&pending),
            Arc::clone(&history),
            Arc::clone(&metrics),
            max_total,
        ));
        Fixture { dispatcher, registry, pending, pool, history, metrics }
    }

    /// Wire up an in-process agent that answers every dispatch with the
    /// given reply builder.
    fn connect_stub_agent(
        fx: &Fixture,
        agent_id: &str,
        addresses: &[&str],
        reply: impl Fn(Uuid) -> Option<JobReply> + Send + 'static,
    ) {
        let (tx, mut rx) = mpsc::channel::<CoordinatorFrame>(32);
        fx.registry
            .register(agent_id, "stub".into(), addresses.iter().map(|s| s.to_string()).collect(), tx)
            .unwrap();
        let pending = Arc::clone(&fx.pending);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let CoordinatorFrame::Dispatch { job_id, .. } = frame {
                    if let Some(reply) = reply(job_id) {
                        pending.complete(job_id, reply);
                    }
                }
            }
        });
    }

    fn request(url: &str, timeout: f64) -> RequestConfig {
        serde_json::from_value(serde_json::json!({"url": url, "timeout": timeout})).unwrap()
    }

    fn ok_reply(status: u16) -> JobReply {
        JobReply::Http { status, headers: vec![], body: b"ok".to_vec(), elapsed_sec: 0.01 }
    }

    #[tokio::test]
    async fn empty_pool_fails_with_no_agents_available() {
        let fx = fixture(4, 100);
        let err = fx.dispatcher.submit(request("http://127.0.0.1:1/", 5.0)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoAgentsAvailable);
        assert_eq!(fx.history.recent(10)[0].error, Some(ErrorKind::NoAgentsAvailable));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_any_pick() {
        let fx = fixture(4, 100);
        connect_stub_agent(&fx, "a1", &["10.0.0.1"], |_| Some(ok_reply(200)));

        for (url, timeout) in
            [("not a url", 5.0), ("ftp://example.com/x", 5.0), ("http://ok.example", 0.0)]
        {
            let err = fx.dispatcher.submit(request(url, timeout)).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidRequest, "{url}");
        }
        // The rejections consumed no picks: the next pick starts at index 0.
        assert_eq!(fx.pool.pick().unwrap().1, "10.0.0.1");
    }

    #[tokio::test]
    async fn happy_path_resolves_and_records() {
        let fx = fixture(4, 100);
        connect_stub_agent(&fx, "a1", &["10.0.0.1"], |_| Some(ok_reply(200)));

        let outcome = fx.dispatcher.submit(request("http://target.test/", 5.0)).await.unwrap();
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.agent_id, "a1");
        assert_eq!(outcome.source_ip, "10.0.0.1");
        assert_eq!(outcome.body, "ok");

        assert!(fx.pending.is_empty());
        let entry = &fx.history.recent(1)[0];
        assert_eq!(entry.status, Some(200));
        assert_eq!(entry.agent_id.as_deref(), Some("a1"));
        assert_eq!(
            fx.metrics.requests_total.with_label_values(&["a1", "200", "GET"]).get(),
            1
        );
    }

    #[tokio::test]
    async fn timeout_resolves_job_and_discards_late_reply() {
        let fx = fixture(4, 100);
        // Agent that never replies.
        connect_stub_agent(&fx, "a1", &["10.0.0.1"], |_| None);

        let started = Instant::now();
        let err = fx.dispatcher.submit(request("http://slow.test/", 0.2)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_millis(600));
        assert!(fx.pending.is_empty());

        let history_len = fx.history.len();
        let errors_before =
            fx.metrics.request_errors_total.with_label_values(&["a1", "Timeout"]).get();

        // A reply arriving after resolution is discarded: nothing changes.
        let late = fx.history.recent(1)[0].job_id;
        assert!(!fx.pending.complete(late, ok_reply(200)));
        assert_eq!(fx.history.len(), history_len);
        assert_eq!(
            fx.metrics.request_errors_total.with_label_values(&["a1", "Timeout"]).get(),
            errors_before
        );
    }

    #[tokio::test]
    async fn saturated_agents_reject_submits() {
        let fx = fixture(1, 100);
        connect_stub_agent(&fx, "a1", &["10.0.0.1"], |_| None);

        // Occupy the single slot.
        let dispatcher = Arc::clone(&fx.dispatcher);
        let blocked =
            tokio::spawn(async move { dispatcher.submit(request("http://t/", 1.0)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = fx.dispatcher.submit(request("http://t/", 1.0)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AgentsSaturated);
        let _ = blocked.await;
    }

    #[tokio::test]
    async fn global_cap_fails_with_overloaded() {
        let fx = fixture(8, 1);
        connect_stub_agent(&fx, "a1", &["10.0.0.1"], |_| None);

        let dispatcher = Arc::clone(&fx.dispatcher);
        let blocked =
            tokio::spawn(async move { dispatcher.submit(request("http://t/", 1.0)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = fx.dispatcher.submit(request("http://t/", 1.0)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CoordinatorOverloaded);
        let _ = blocked.await;
    }

    #[tokio::test]
    async fn agent_error_reply_surfaces_verbatim() {
        let fx = fixture(4, 100);
        connect_stub_agent(&fx, "a1", &["10.0.0.1"], |_| {
            Some(JobReply::Failed(DispatchError::new(ErrorKind::BindError, "no such address")))
        });

        let err = fx.dispatcher.submit(request("http://t/", 5.0)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BindError);
        assert_eq!(err.message, "no such address");
        assert_eq!(fx.history.recent(1)[0].error, Some(ErrorKind::BindError));
    }

    #[tokio::test]
    async fn dropped_submit_future_cancels_the_job() {
        let fx = fixture(4, 100);
        connect_stub_agent(&fx, "a1", &["10.0.0.1"], |_| None);

        let dispatcher = Arc::clone(&fx.dispatcher);
        let handle =
            tokio::spawn(async move { dispatcher.submit(request("http://t/", 30.0)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.pending.len(), 1);

        // Simulates the REST client hanging up: axum drops the handler.
        handle.abort();
        let _ = handle.await;

        assert!(fx.pending.is_empty());
        assert_eq!(fx.history.recent(1)[0].error, Some(ErrorKind::Cancelled));
        // The agent's slot was released.
        assert!(fx.registry.try_reserve("a1"));
    }

    #[tokio::test]
    async fn round_robin_across_submits() {
        let fx = fixture(16, 100);
        connect_stub_agent(&fx, "a1", &["10.0.0.1", "10.0.0.2"], |_| Some(ok_reply(200)));

        let mut ips = Vec::new();
        for _ in 0..4 {
            ips.push(fx.dispatcher.submit(request("http://t/", 5.0)).await.unwrap().source_ip);
        }
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2", "10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn params_fold_into_url() {
        let config: RequestConfig = serde_json::from_value(serde_json::json!({
            "url": "http://example.com/search",
            "params": {"q": "rust", "page": "2"},
        }))
        .unwrap();
        let validated = validate(config).unwrap();
        assert_eq!(validated.url, "http://example.com/search?q=rust&page=2");
        assert!(validated.params.is_none());
    }

    #[test]
    fn pending_table_enforces_cap_and_late_discard() {
        let table = PendingTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let _rx_a = table.insert(a, "a1", 1).unwrap();
        let err = table.insert(b, "a1", 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CoordinatorOverloaded);

        assert!(table.remove(a));
        assert!(!table.remove(a));
        assert!(!table.complete(a, JobReply::Failed(DispatchError::new(ErrorKind::Timeout, ""))));
    }
}
