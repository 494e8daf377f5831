//! HTTP egress dispatcher coordinator library.
//!
//! The coordinator accepts HTTP request jobs over a REST API and dispatches
//! each one to a connected agent, which executes the outbound request from a
//! specific local source IP. The binary entry point is in main.rs.

pub mod config;
pub mod dispatch;
pub mod history;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod server;
