//! Runtime configuration for the coordinator daemon.
//!
//! The operator surface is flags plus `DISPATCHER_*` environment variables
//! (wired up via clap in main.rs); this module holds the resolved values
//! and the listener parsing shared by the binary and the tests.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::pool::Fairness;

/// Agents heartbeat on this cadence; the registry declares an agent dead
/// after three missed intervals.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub listeners: Vec<SocketAddr>,
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
    pub max_in_flight_per_agent: usize,
    pub max_total_in_flight: usize,
    pub history_capacity: usize,
    pub history_body_cap: usize,
    pub fairness: Fairness,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            stale_after: HEARTBEAT_INTERVAL * 3,
            max_in_flight_per_agent: 64,
            max_total_in_flight: 4096,
            history_capacity: 1000,
            history_body_cap: 64 * 1024,
            fairness: Fairness::PerIp,
        }
    }
}

/// Resolve the primary `host:port` plus any `--bind` extras into listener
/// addresses, deduplicated in first-seen order.
pub fn parse_listeners(host: &str, port: u16, binds: &[String]) -> Result<Vec<SocketAddr>> {
    let mut listeners = Vec::new();
    let mut push = |addr: SocketAddr| {
        if !listeners.contains(&addr) {
            listeners.push(addr);
        }
    };

    push(resolve(host, port)?);
    for bind in binds {
        let addr = match bind.rsplit_once(':') {
            // `HOST:PORT`, with bracketed IPv6 handled by the resolver.
            Some((h, p)) if !h.is_empty() => {
                let bind_port: u16 = p
                    .parse()
                    .with_context(|| format!("invalid bind address '{bind}'"))?;
                resolve(h, bind_port)?
            }
            // Bare host reuses the primary port.
            _ => resolve(bind, port)?,
        };
        push(addr);
    }
    Ok(listeners)
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let mut addrs = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve '{host}:{port}'"))?;
    match addrs.next() {
        Some(addr) => Ok(addr),
        None => bail!("'{host}:{port}' resolved to no addresses"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_listener_comes_first() {
        let listeners = parse_listeners("127.0.0.1", 8000, &[]).unwrap();
        assert_eq!(listeners, vec!["127.0.0.1:8000".parse().unwrap()]);
    }

    #[test]
    fn extra_binds_are_appended_and_deduplicated() {
        let listeners = parse_listeners(
            "127.0.0.1",
            8000,
            &[
                "127.0.0.1:9000".to_string(),
                "127.0.0.1:8000".to_string(), // duplicate of the primary
                "0.0.0.0:9000".to_string(),
            ],
        )
        .unwrap();
        assert_eq!(
            listeners,
            vec![
                "127.0.0.1:8000".parse().unwrap(),
                "127.0.0.1:9000".parse().unwrap(),
                "0.0.0.0:9000".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn bare_host_bind_reuses_primary_port() {
        let listeners =
            parse_listeners("127.0.0.1", 8000, &["0.0.0.0".to_string()]).unwrap();
        assert_eq!(listeners[1], "0.0.0.0:8000".parse().unwrap());
    }

    #[test]
    fn bracketed_ipv6_binds_parse() {
        let listeners = parse_listeners("::1", 8000, &["[::1]:9000".to_string()]).unwrap();
        assert_eq!(listeners, vec!["[::1]:8000".parse().unwrap(), "[::1]:9000".parse().unwrap()]);
    }

    #[test]
    fn invalid_port_is_an_error() {
        assert!(parse_listeners("127.0.0.1", 8000, &["127.0.0.1:http".to_string()]).is_err());
    }

    #[test]
    fn defaults_match_contract() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.stale_after, Duration::from_secs(45));
        assert_eq!(config.max_in_flight_per_agent, 64);
        assert_eq!(config.max_total_in_flight, 4096);
        assert_eq!(config.history_capacity, 1000);
        assert_eq!(config.history_body_cap, 65536);
    }
}
