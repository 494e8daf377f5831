//! Agent-side runtime for the HTTP dispatcher.
//!
//! An agent process connects outbound to the coordinator over a WebSocket,
//! reports the local source addresses it can bind, and executes dispatched
//! HTTP requests from the source IP the coordinator selected.

pub mod error;
pub mod executor;
pub mod inventory;
pub mod session;

pub use error::{Error, Result};
pub use executor::{BoundExecutor, BoundRequest, ExecResult};
pub use session::{AgentSession, SessionConfig};
