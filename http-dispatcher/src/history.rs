//! Bounded in-memory history of resolved jobs.
//!
//! A FIFO ring of terminal jobs for diagnostic retrieval; the oldest entry
//! is evicted silently once the ring is full. Response bodies are truncated
//! to a configurable cap before storage so a single large response cannot
//! blow up the coordinator's memory.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dispatcher_proto::{ErrorKind, HttpMethod};
use serde::Serialize;
use uuid::Uuid;

/// One resolved job as retained for `GET /api/history`.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub job_id: Uuid,
    pub method: HttpMethod,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    pub latency_sec: f64,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Truncated response body, lossily decoded as UTF-8.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

pub struct History {
    inner: Mutex<VecDeque<HistoryEntry>>,
    capacity: usize,
    body_cap: usize,
}

impl History {
    pub fn new(capacity: usize, body_cap: usize) -> Self {
        Self { inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))), capacity, body_cap }
    }

    pub fn record(&self, mut entry: HistoryEntry) {
        if let Some(body) = entry.body.take() {
            entry.body = Some(truncate_utf8(body, self.body_cap));
        }
        let mut ring = self.inner.lock().unwrap();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// The most recent `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        let ring = self.inner.lock().unwrap();
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Truncate to at most `cap` bytes without splitting a UTF-8 sequence.
fn truncate_utf8(mut text: String, cap: usize) -> String {
    if text.len() <= cap {
        return text;
    }
    let mut end = cap;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, body: Option<&str>) -> HistoryEntry {
        let now = Utc::now();
        HistoryEntry {
            job_id: Uuid::new_v4(),
            method: HttpMethod::GET,
            url: url.to_string(),
            status: Some(200),
            error: None,
            agent_id: Some("a1".into()),
            source_ip: Some("::1".into()),
            latency_sec: 0.1,
            submitted_at: now,
            completed_at: now,
            body: body.map(String::from),
        }
    }

    #[test]
    fn ring_evicts_oldest_silently() {
        let history = History::new(3, 1024);
        for i in 0..5 {
            history.record(entry(&format!("http://t/{i}"), None));
        }
        assert_eq!(history.len(), 3);
        let urls: Vec<_> = history.recent(10).into_iter().map(|e| e.url).collect();
        assert_eq!(urls, vec!["http://t/2", "http://t/3", "http://t/4"]);
    }

    #[test]
    fn recent_returns_tail() {
        let history = History::new(10, 1024);
        for i in 0..4 {
            history.record(entry(&format!("http://t/{i}"), None));
        }
        let urls: Vec<_> = history.recent(2).into_iter().map(|e| e.url).collect();
        assert_eq!(urls, vec!["http://t/2", "http://t/3"]);
    }

    #[test]
    fn bodies_are_capped_on_char_boundaries() {
        let history = History::new(4, 8);
        history.record(entry("http://t/", Some("0123456789abcdef")));
        assert_eq!(history.recent(1)[0].body.as_deref(), Some("01234567"));

        // "é" is 2 bytes; cutting at byte 9 would split the fifth one.
        let history = History::new(4, 9);
        history.record(entry("http://t/", Some("éééééé")));
        assert_eq!(history.recent(1)[0].body.as_deref(), Some("éééé"));
    }
}
