//! Prometheus instrumentation for the dispatch path.
//!
//! The metric names are wire-stable: dashboards and alerts reference them,
//! so they must not change even when the internals do.
//!
//! The instruments live on an owned [`Metrics`] value with its own private
//! registry rather than in process-wide statics. The coordinator builds one
//! instance at startup and hands an `Arc` to the dispatcher, registry and
//! pool; tests build their own and observe it in isolation.

use std::time::Instant;

use prometheus::{
    Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

// Instrument construction only fails on malformed names or duplicate
// registration, both programming errors, so expect() here is terminal by
// intent.
#[allow(clippy::expect_used)]
fn register<M: prometheus::core::Collector + Clone + 'static>(registry: &Registry, m: M) -> M {
    registry.register(Box::new(m.clone())).expect("metric registration");
    m
}

/// Counters, gauges and histograms for one coordinator process.
pub struct Metrics {
    registry: Registry,
    started: Instant,

    /// `http_dispatcher_requests_total{agent,status,method}`
    pub requests_total: IntCounterVec,
    /// `http_dispatcher_request_errors_total{agent,error_type}`
    pub request_errors_total: IntCounterVec,
    /// `http_dispatcher_request_duration_seconds{agent,method}`
    pub request_duration_seconds: HistogramVec,
    /// `http_dispatcher_agents_connected`
    pub agents_connected: IntGauge,
    /// `http_dispatcher_agents_total`
    pub agents_total: IntGauge,
    /// `http_dispatcher_ip_pool_size`
    pub ip_pool_size: IntGauge,
    /// `http_dispatcher_ip_pool_available`
    pub ip_pool_available: IntGauge,
    /// `http_dispatcher_websocket_connections`
    pub websocket_connections: IntGauge,
    /// `http_dispatcher_agent_requests_total{agent}`
    pub agent_requests_total: IntCounterVec,
    /// `http_dispatcher_response_size_bytes{agent}`
    pub response_size_bytes: HistogramVec,
    /// `http_dispatcher_queue_depth{agent}`
    pub queue_depth: IntGaugeVec,
    /// `http_dispatcher_uptime_seconds`
    uptime_seconds: Gauge,
}

#[allow(clippy::expect_used)]
impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "http_dispatcher_requests_total",
                    "Resolved jobs by agent, status and method",
                ),
                &["agent", "status", "method"],
            )
            .expect("valid metric"),
        );
        let request_errors_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "http_dispatcher_request_errors_total",
                    "Failed jobs by agent and error type",
                ),
                &["agent", "error_type"],
            )
            .expect("valid metric"),
        );
        let request_duration_seconds = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "http_dispatcher_request_duration_seconds",
                    "Job latency from submit to resolution",
                ),
                &["agent", "method"],
            )
            .expect("valid metric"),
        );
        let agents_connected = register(
            &registry,
            IntGauge::new("http_dispatcher_agents_connected", "Agents with a live session")
                .expect("valid metric"),
        );
        let agents_total = register(
            &registry,
            IntGauge::new("http_dispatcher_agents_total", "Agents known to the registry")
                .expect("valid metric"),
        );
        let ip_pool_size = register(
            &registry,
            IntGauge::new("http_dispatcher_ip_pool_size", "Source IPs in the pool")
                .expect("valid metric"),
        );
        let ip_pool_available = register(
            &registry,
            IntGauge::new("http_dispatcher_ip_pool_available", "Source IPs eligible for picks")
                .expect("valid metric"),
        );
        let websocket_connections = register(
            &registry,
            IntGauge::new("http_dispatcher_websocket_connections", "Open agent WebSockets")
                .expect("valid metric"),
        );
        let agent_requests_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("http_dispatcher_agent_requests_total", "Jobs dispatched per agent"),
                &["agent"],
            )
            .expect("valid metric"),
        );
        let response_size_bytes = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "http_dispatcher_response_size_bytes",
                    "Response body sizes per agent",
                )
                .buckets(vec![
                    256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0, 4194304.0,
                ]),
                &["agent"],
            )
            .expect("valid metric"),
        );
        let queue_depth = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("http_dispatcher_queue_depth", "In-flight jobs per agent"),
                &["agent"],
            )
            .expect("valid metric"),
        );
        let uptime_seconds = register(
            &registry,
            Gauge::new("http_dispatcher_uptime_seconds", "Coordinator uptime")
                .expect("valid metric"),
        );

        Self {
            registry,
            started: Instant::now(),
            requests_total,
            request_errors_total,
            request_duration_seconds,
            agents_connected,
            agents_total,
            ip_pool_size,
            ip_pool_available,
            websocket_connections,
            agent_requests_total,
            response_size_bytes,
            queue_depth,
            uptime_seconds,
        }
    }

    /// Record a job that resolved with an HTTP response.
    pub fn record_completed(
        &self,
        agent: &str,
        status: u16,
        method: &str,
        duration_secs: f64,
        body_len: usize,
    ) {
        self.requests_total
            .with_label_values(&[agent, &status.to_string(), method])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[agent, method])
            .observe(duration_secs);
        self.agent_requests_total.with_label_values(&[agent]).inc();
        self.response_size_bytes
            .with_label_values(&[agent])
            .observe(body_len as f64);
    }

    /// Record a job that resolved with a failure. `agent` is empty when the
    /// job never reached one.
    pub fn record_failed(&self, agent: &str, error_type: &str, method: &str, duration_secs: f64) {
        self.requests_total
            .with_label_values(&[agent, "error", method])
            .inc();
        self.request_errors_total
            .with_label_values(&[agent, error_type])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[agent, method])
            .observe(duration_secs);
    }

    /// Prometheus text exposition of everything in this registry.
    pub fn render(&self) -> String {
        self.uptime_seconds.set(self.started.elapsed().as_secs_f64());
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
