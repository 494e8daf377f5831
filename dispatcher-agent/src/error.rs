//! Error types for the agent runtime.

use thiserror::Error;

/// Agent transport/session error type.
///
/// Executor failures are not represented here: they travel to the
/// coordinator as classified `error` frames and never tear down the
/// session.
#[derive(Debug, Error)]
pub enum Error {
    /// The coordinator URL could not be turned into a WebSocket URL.
    #[error("Invalid coordinator URL: {0}")]
    InvalidUrl(String),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The coordinator refused our `register` frame.
    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    /// The coordinator never answered the `register` frame.
    #[error("Timed out waiting for registration reply")]
    RegistrationTimeout,

    /// The coordinator closed the connection mid-session.
    #[error("Connection closed by coordinator")]
    ConnectionClosed,

    /// Frame encoding error.
    #[error("Frame encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the agent runtime.
pub type Result<T, E = Error> = std::result::Result<T, E>;
