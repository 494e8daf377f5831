//! Wire types for the dispatcher control plane.
//!
//! The coordinator and agents exchange JSON text frames over a WebSocket,
//! one message per frame, discriminated by a `type` field. This crate owns
//! those frame definitions plus the request/error vocabulary both sides
//! share, so the two halves of the system cannot drift apart.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// HTTP methods accepted by the dispatch path.
///
/// Anything outside this set is rejected with [`ErrorKind::InvalidRequest`]
/// before a job is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    #[default]
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::PATCH => "PATCH",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(HttpMethod::GET),
            "POST" => Ok(HttpMethod::POST),
            "PUT" => Ok(HttpMethod::PUT),
            "DELETE" => Ok(HttpMethod::DELETE),
            "PATCH" => Ok(HttpMethod::PATCH),
            other => Err(DispatchError::new(
                ErrorKind::InvalidRequest,
                format!("unsupported HTTP method: {other}"),
            )),
        }
    }
}

fn default_timeout() -> f64 {
    30.0
}

/// A request template, either stored as the legacy singleton config or
/// submitted inline on `POST /api/execute`.
///
/// Header order is preserved end to end, so re-encoding a decoded config
/// yields the original document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<IndexMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default = "default_timeout")]
    pub timeout: f64,
}

/// Connection state of an agent as tracked by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Connecting,
    Registered,
    Live,
    Draining,
    Dead,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentState::Connecting => "connecting",
            AgentState::Registered => "registered",
            AgentState::Live => "live",
            AgentState::Draining => "draining",
            AgentState::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Failure taxonomy, surfaced verbatim to API callers and on the wire.
///
/// The first group originates in the coordinator's dispatch path, the
/// second is propagated from the agent-side executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NoAgentsAvailable,
    AgentsSaturated,
    CoordinatorOverloaded,
    AgentLost,
    AgentReplaced,
    Timeout,
    Cancelled,
    BindError,
    #[serde(rename = "DNSError")]
    DnsError,
    ConnectError,
    #[serde(rename = "TLSError")]
    TlsError,
    ReadError,
    TooManyRedirects,
    InvalidRequest,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoAgentsAvailable => "NoAgentsAvailable",
            ErrorKind::AgentsSaturated => "AgentsSaturated",
            ErrorKind::CoordinatorOverloaded => "CoordinatorOverloaded",
            ErrorKind::AgentLost => "AgentLost",
            ErrorKind::AgentReplaced => "AgentReplaced",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::BindError => "BindError",
            ErrorKind::DnsError => "DNSError",
            ErrorKind::ConnectError => "ConnectError",
            ErrorKind::TlsError => "TLSError",
            ErrorKind::ReadError => "ReadError",
            ErrorKind::TooManyRedirects => "TooManyRedirects",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::Other => "Other",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified dispatch failure: the taxonomy kind plus human detail.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct DispatchError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DispatchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// Frames sent agent → coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    /// First frame on every connection.
    Register {
        agent_id: String,
        hostname: String,
        addresses: Vec<String>,
        agent_version: String,
    },
    /// Successful completion of a dispatched job.
    Result {
        job_id: Uuid,
        status: u16,
        response_headers: Vec<(String, String)>,
        response_body_b64: String,
        elapsed_sec: f64,
    },
    /// Failed completion of a dispatched job.
    Error {
        job_id: Uuid,
        kind: ErrorKind,
        message: String,
    },
    /// Periodic liveness frame, carrying the current address inventory.
    Heartbeat { addresses: Vec<String>, ts: f64 },
    /// All in-flight jobs finished after a `drain` request.
    Drained,
}

/// Frames sent coordinator → agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorFrame {
    /// Registration accepted. `assigned_agent_id` normally echoes the
    /// requested id but may differ if the coordinator had to resolve a
    /// conflict.
    Registered {
        assigned_agent_id: String,
        server_time: f64,
    },
    /// Execute one HTTP request from `source_ip`.
    Dispatch {
        job_id: Uuid,
        source_ip: String,
        method: HttpMethod,
        url: String,
        headers: IndexMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
        timeout_sec: f64,
    },
    AckHeartbeat { ts: f64 },
    /// Stop accepting new jobs, finish in-flight ones, reply `drained`.
    Drain,
}

/// Outcome of decoding one text frame.
///
/// Unknown frame types are tolerated for forward compatibility: callers
/// log and ignore them rather than dropping the connection.
#[derive(Debug)]
pub enum Decoded<T> {
    Frame(T),
    /// Valid JSON, but not a frame this side understands. Carries the
    /// `type` discriminator (or `"?"` if absent) for logging.
    Unknown(String),
    Malformed(serde_json::Error),
}

pub fn decode_frame<T: serde::de::DeserializeOwned>(text: &str) -> Decoded<T> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return Decoded::Malformed(e),
    };
    let frame_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("?")
        .to_string();
    match serde_json::from_value(value) {
        Ok(frame) => Decoded::Frame(frame),
        Err(_) => Decoded::Unknown(frame_type),
    }
}
