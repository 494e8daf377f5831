//! Source-bound outbound HTTP execution.
//!
//! One [`BoundExecutor::execute`] call performs one HTTP request whose TCP
//! socket is bound to a caller-supplied local source IP. The client is
//! built per request so the bind address, timeouts and redirect cap always
//! match the job; every redirect hop reuses the same bound client, so a
//! cross-family redirect fails at connect time instead of silently
//! switching source addresses.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dispatcher_proto::{DispatchError, ErrorKind, HttpMethod};
use indexmap::IndexMap;
use tracing::debug;

/// Default slack beyond the job timeout before the executor gives up on
/// the whole exchange, covering response-body reads that start just under
/// the deadline.
const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Redirect hops followed before failing with `TooManyRedirects`.
const DEFAULT_MAX_REDIRECTS: usize = 10;

/// One outbound request to perform from a specific source address.
#[derive(Debug, Clone)]
pub struct BoundRequest {
    /// Textual source IP; bracketed IPv6 literals and zone suffixes are
    /// accepted and unwrapped before binding.
    pub source_ip: String,
    pub method: HttpMethod,
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub body: Option<serde_json::Value>,
    pub timeout: Duration,
}

/// Successful outcome of a bound request.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub elapsed: Duration,
}

/// Executes bound requests with fixed redirect and grace policies.
#[derive(Debug, Clone)]
pub struct BoundExecutor {
    grace: Duration,
    max_redirects: usize,
}

impl Default for BoundExecutor {
    fn default() -> Self {
        Self { grace: DEFAULT_GRACE, max_redirects: DEFAULT_MAX_REDIRECTS }
    }
}

impl BoundExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Perform one request. Total wall time never exceeds
    /// `request.timeout + grace`.
    pub async fn execute(&self, request: BoundRequest) -> Result<ExecResult, DispatchError> {
        let source_ip = parse_source_ip(&request.source_ip)?;
        let client = reqwest::Client::builder()
            .local_address(source_ip)
            .connect_timeout(request.timeout)
            .timeout(request.timeout)
            .redirect(reqwest::redirect::Policy::limited(self.max_redirects))
            .build()
            .map_err(|e| DispatchError::new(ErrorKind::Other, chain_message(&e)))?;

        let mut builder = client.request(as_reqwest_method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = match body {
                // A JSON string body is sent as raw UTF-8 bytes.
                serde_json::Value::String(text) => builder.body(text.clone()),
                other => {
                    let has_content_type = request
                        .headers
                        .keys()
                        .any(|k| k.eq_ignore_ascii_case("content-type"));
                    if has_content_type {
                        let bytes = serde_json::to_vec(other).map_err(|e| {
                            DispatchError::new(ErrorKind::InvalidRequest, e.to_string())
                        })?;
                        builder.body(bytes)
                    } else {
                        builder.json(other)
                    }
                }
            };
        }

        debug!(source_ip = %source_ip, url = %request.url, "executing bound request");
        let wall = request.timeout + self.grace;
        let started = Instant::now();

        let response = tokio::time::timeout(wall, builder.send())
            .await
            .map_err(|_| timeout_error(wall))?
            .map_err(|e| classify(&e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (name.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned())
            })
            .collect();

        let remaining = wall.saturating_sub(started.elapsed());
        let body = tokio::time::timeout(remaining, response.bytes())
            .await
            .map_err(|_| timeout_error(wall))?
            .map_err(|e| classify(&e))?;

        Ok(ExecResult { status, headers, body: body.to_vec(), elapsed: started.elapsed() })
    }
}

fn timeout_error(wall: Duration) -> DispatchError {
    DispatchError::new(
        ErrorKind::Timeout,
        format!("no response within {:.1}s", wall.as_secs_f64()),
    )
}

fn as_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::GET => reqwest::Method::GET,
        HttpMethod::POST => reqwest::Method::POST,
        HttpMethod::PUT => reqwest::Method::PUT,
        HttpMethod::DELETE => reqwest::Method::DELETE,
        HttpMethod::PATCH => reqwest::Method::PATCH,
    }
}

/// Parse a textual source address, unwrapping `[...]` brackets and
/// stripping any `%zone` suffix.
pub fn parse_source_ip(text: &str) -> Result<IpAddr, DispatchError> {
    let trimmed = text.trim();
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    let bare = unbracketed.split('%').next().unwrap_or(unbracketed);
    bare.parse().map_err(|_| {
        DispatchError::new(ErrorKind::BindError, format!("invalid source address: {text}"))
    })
}

/// Map a reqwest failure onto the dispatch error taxonomy.
fn classify(err: &reqwest::Error) -> DispatchError {
    let message = chain_message(err);
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_redirect() {
        ErrorKind::TooManyRedirects
    } else if err.is_builder() {
        ErrorKind::InvalidRequest
    } else if let Some(io_kind) = find_io_kind(err) {
        kind_for_io(io_kind, err.is_connect(), &message)
    } else if err.is_connect() {
        kind_for_text(&message, ErrorKind::ConnectError)
    } else if err.is_body() || err.is_decode() {
        ErrorKind::ReadError
    } else {
        kind_for_text(&message, ErrorKind::Other)
    };
    DispatchError::new(kind, message)
}

/// Walk the source chain looking for the underlying `io::Error`.
fn find_io_kind(err: &(dyn std::error::Error + 'static)) -> Option<std::io::ErrorKind> {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = inner.source();
    }
    None
}

fn kind_for_io(kind: std::io::ErrorKind, is_connect: bool, message: &str) -> ErrorKind {
    use std::io::ErrorKind as Io;
    match kind {
        Io::AddrNotAvailable | Io::AddrInUse | Io::InvalidInput => ErrorKind::BindError,
        Io::TimedOut => ErrorKind::Timeout,
        Io::ConnectionRefused | Io::ConnectionReset | Io::ConnectionAborted => {
            ErrorKind::ConnectError
        }
        Io::PermissionDenied if is_connect => ErrorKind::ConnectError,
        _ => {
            let fallback = if is_connect { ErrorKind::ConnectError } else { ErrorKind::ReadError };
            kind_for_text(message, fallback)
        }
    }
}

/// Last-resort classification from the rendered error chain. DNS and TLS
/// failures do not surface a distinguishable error type from the client,
/// only their message text.
fn kind_for_text(message: &str, fallback: ErrorKind) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("dns") || lower.contains("resolve") || lower.contains("lookup") {
        ErrorKind::DnsError
    } else if lower.contains("certificate")
        || lower.contains("tls")
        || lower.contains("ssl")
        || lower.contains("handshake")
    {
        ErrorKind::TlsError
    } else {
        fallback
    }
}

/// Render an error with its full source chain, oldest cause last.
fn chain_message(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
