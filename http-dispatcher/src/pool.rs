//! Source-IP pool and round-robin selector.
//!
//! Pool membership is derived: an entry `(agent_id, ip)` exists only while
//! its owning agent is live, and the registry mutates the pool atomically
//! whenever an agent registers, heartbeats with a changed address set, or
//! goes away.
//!
//! Selection rotates a monotone counter over the sorted view of entries.
//! The counter is never reset: after churn the next pick computes
//! `counter % current_size`, so rotation resumes mid-cycle instead of
//! restarting at a fixed element and no entry is starved.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::metrics::Metrics;

/// Rotation policy for `pick()`.
///
/// `PerIp` (the default) rotates over individual pool entries, so agents
/// with more addresses receive proportionally more load. `PerAgent`
/// rotates over agents first and only then over that agent's addresses,
/// which evens out load when one agent dominates the IP count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Fairness {
    #[default]
    PerIp,
    PerAgent,
}

/// One pool entry as reported by `GET /api/pool/status`.
#[derive(Debug, Clone, Serialize)]
pub struct PoolEntry {
    pub agent_id: String,
    pub ip: String,
    pub requests_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct EntryStats {
    requests_count: u64,
    last_used: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct PoolInner {
    agents: BTreeMap<String, BTreeSet<String>>,
    stats: HashMap<(String, String), EntryStats>,
    /// Sorted `(agent_id, ip)` view, rebuilt on every mutation.
    flat: Vec<(String, String)>,
    cursor: u64,
    agent_cursors: HashMap<String, u64>,
}

impl PoolInner {
    fn rebuild_flat(&mut self) {
        self.flat = self
            .agents
            .iter()
            .flat_map(|(agent, ips)| {
                ips.iter().map(move |ip| (agent.clone(), ip.clone()))
            })
            .collect();
        self.stats
            .retain(|(agent, ip), _| self.agents.get(agent).is_some_and(|ips| ips.contains(ip)));
    }
}

pub struct IpPool {
    inner: Mutex<PoolInner>,
    fairness: Fairness,
    metrics: Arc<Metrics>,
}

impl IpPool {
    pub fn new(fairness: Fairness, metrics: Arc<Metrics>) -> Self {
        Self { inner: Mutex::new(PoolInner::default()), fairness, metrics }
    }

    /// Replace an agent's entries with `addresses`. Handles first-time adds
    /// and heartbeat diffs alike; an empty set removes the agent entirely.
    pub fn update(&self, agent_id: &str, addresses: &[String]) {
        let mut inner = self.inner.lock().unwrap();
        let set: BTreeSet<String> = addresses.iter().cloned().collect();
        if set.is_empty() {
            inner.agents.remove(agent_id);
            inner.agent_cursors.remove(agent_id);
        } else {
            inner.agents.insert(agent_id.to_string(), set);
        }
        inner.rebuild_flat();
        let size = inner.flat.len();
        drop(inner);
        self.publish_size(size);
        debug!(agent_id = %agent_id, addresses = addresses.len(), pool_size = size, "pool updated");
    }

    /// Drop all entries owned by `agent_id`.
    pub fn remove(&self, agent_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.agents.remove(agent_id).is_none() {
            return;
        }
        inner.agent_cursors.remove(agent_id);
        inner.rebuild_flat();
        let size = inner.flat.len();
        drop(inner);
        self.publish_size(size);
        debug!(agent_id = %agent_id, pool_size = size, "agent removed from pool");
    }

    /// Select the next `(agent_id, ip)` in rotation, or `None` when the
    /// pool is empty.
    pub fn pick(&self) -> Option<(String, String)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.flat.is_empty() {
            return None;
        }
        match self.fairness {
            Fairness::PerIp => {
                let index = (inner.cursor % inner.flat.len() as u64) as usize;
                inner.cursor = inner.cursor.wrapping_add(1);
                Some(inner.flat[index].clone())
            }
            Fairness::PerAgent => {
                let agent_index = (inner.cursor % inner.agents.len() as u64) as usize;
                inner.cursor = inner.cursor.wrapping_add(1);
                let (agent, ips) = inner
                    .agents
                    .iter()
                    .nth(agent_index)
                    .map(|(a, ips)| (a.clone(), ips.iter().cloned().collect::<Vec<_>>()))?;
                let ip_cursor = inner.agent_cursors.entry(agent.clone()).or_insert(0);
                let ip = ips[(*ip_cursor % ips.len() as u64) as usize].clone();
                *ip_cursor = ip_cursor.wrapping_add(1);
                Some((agent, ip))
            }
        }
    }

    /// Bump usage bookkeeping for an entry that a job was dispatched to.
    pub fn mark_used(&self, agent_id: &str, ip: &str) {
        let mut inner = self.inner.lock().unwrap();
        let stats = inner
            .stats
            .entry((agent_id.to_string(), ip.to_string()))
            .or_default();
        stats.requests_count += 1;
        stats.last_used = Some(Utc::now());
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().flat.len()
    }

    pub fn status(&self) -> Vec<PoolEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .flat
            .iter()
            .map(|(agent, ip)| {
                let stats = inner.stats.get(&(agent.clone(), ip.clone()));
                PoolEntry {
                    agent_id: agent.clone(),
                    ip: ip.clone(),
                    requests_count: stats.map(|s| s.requests_count).unwrap_or(0),
                    last_used: stats.and_then(|s| s.last_used),
                }
            })
            .collect()
    }

    fn publish_size(&self, size: usize) {
        self.metrics.ip_pool_size.set(size as i64);
        self.metrics.ip_pool_available.set(size as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(fairness: Fairness) -> IpPool {
        IpPool::new(fairness, Arc::new(Metrics::new()))
    }

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn static_pool_is_exact_round_robin() {
        let pool = pool(Fairness::PerIp);
        pool.update("a1", &addrs(&["10.0.0.1", "10.0.0.2"]));
        pool.update("a2", &addrs(&["10.0.0.3"]));

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..9 {
            let (_, ip) = pool.pick().unwrap();
            *counts.entry(ip).or_default() += 1;
        }
        // 9 picks over 3 entries: each selected exactly 3 times.
        assert_eq!(counts["10.0.0.1"], 3);
        assert_eq!(counts["10.0.0.2"], 3);
        assert_eq!(counts["10.0.0.3"], 3);
    }

    #[test]
    fn picks_follow_sorted_order_from_zero() {
        let pool = pool(Fairness::PerIp);
        pool.update("a1", &addrs(&["::1", "127.0.0.2"]));
        let order: Vec<String> = (0..4).map(|_| pool.pick().unwrap().1).collect();
        // Entries sort lexicographically by (agent_id, ip_text).
        assert_eq!(order, vec!["127.0.0.2", "::1", "127.0.0.2", "::1"]);
    }

    #[test]
    fn empty_pool_returns_none() {
        let pool = pool(Fairness::PerIp);
        assert!(pool.pick().is_none());
        pool.update("a1", &addrs(&["10.0.0.1"]));
        assert!(pool.pick().is_some());
        pool.remove("a1");
        assert!(pool.pick().is_none());
    }

    #[test]
    fn cursor_survives_churn() {
        let pool = pool(Fairness::PerIp);
        pool.update("a1", &addrs(&["a", "b"]));
        // Advance the cursor to an odd position.
        assert_eq!(pool.pick().unwrap().1, "a");
        assert_eq!(pool.pick().unwrap().1, "b");
        assert_eq!(pool.pick().unwrap().1, "a");

        // Heartbeat replaces the address set; the counter is 3, not reset.
        pool.update("a1", &addrs(&["b", "c"]));
        assert_eq!(pool.pick().unwrap().1, "c"); // 3 % 2 == 1
        assert_eq!(pool.pick().unwrap().1, "b");
    }

    #[test]
    fn replaced_addresses_never_resurface() {
        let pool = pool(Fairness::PerIp);
        pool.update("a1", &addrs(&["a", "b"]));
        pool.update("a1", &addrs(&["b", "c"]));
        for _ in 0..10 {
            let (_, ip) = pool.pick().unwrap();
            assert_ne!(ip, "a");
        }
    }

    #[test]
    fn update_with_empty_set_clears_agent() {
        let pool = pool(Fairness::PerIp);
        pool.update("a1", &addrs(&["a"]));
        pool.update("a2", &addrs(&["b"]));
        pool.update("a1", &[]);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.pick().map(|(a, _)| a).as_deref(), Some("a2"));
    }

    #[test]
    fn per_agent_fairness_balances_across_agents() {
        let pool = pool(Fairness::PerAgent);
        pool.update("big", &addrs(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]));
        pool.update("small", &addrs(&["10.0.1.1"]));

        let mut per_agent: HashMap<String, usize> = HashMap::new();
        for _ in 0..8 {
            let (agent, _) = pool.pick().unwrap();
            *per_agent.entry(agent).or_default() += 1;
        }
        // Four picks each, despite the 4:1 address imbalance.
        assert_eq!(per_agent["big"], 4);
        assert_eq!(per_agent["small"], 4);
    }

    #[test]
    fn per_agent_rotates_within_agent() {
        let pool = pool(Fairness::PerAgent);
        pool.update("a1", &addrs(&["x", "y"]));
        let picks: Vec<String> = (0..4).map(|_| pool.pick().unwrap().1).collect();
        assert_eq!(picks, vec!["x", "y", "x", "y"]);
    }

    #[test]
    fn usage_bookkeeping_shows_in_status() {
        let pool = pool(Fairness::PerIp);
        pool.update("a1", &addrs(&["10.0.0.1"]));
        pool.mark_used("a1", "10.0.0.1");
        pool.mark_used("a1", "10.0.0.1");
        let status = pool.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].requests_count, 2);
        assert!(status[0].last_used.is_some());
    }

    #[test]
    fn pool_size_gauge_tracks_membership() {
        let metrics = Arc::new(Metrics::new());
        let pool = IpPool::new(Fairness::PerIp, Arc::clone(&metrics));
        pool.update("a1", &addrs(&["a", "b"]));
        assert_eq!(metrics.ip_pool_size.get(), 2);
        pool.remove("a1");
        assert_eq!(metrics.ip_pool_size.get(), 0);
    }
}
