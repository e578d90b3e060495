// src/ingest/throttle.rs
//! Last known throttle state per provider, written by the orchestrator and probed by
//! the Health Monitor.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleState {
    /// Set when a provider's retries ended on a rate-limit response.
    pub exhausted_at: Option<DateTime<Utc>>,
    pub last_ok_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct ThrottleStatus {
    inner: DashMap<String, ThrottleState>,
}

impl ThrottleStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ok(&self, provider: &str, at: DateTime<Utc>) {
        let mut e = self.inner.entry(provider.to_string()).or_default();
        e.last_ok_at = Some(at);
        e.exhausted_at = None;
    }

    pub fn mark_exhausted(&self, provider: &str, at: DateTime<Utc>) {
        let mut e = self.inner.entry(provider.to_string()).or_default();
        e.exhausted_at = Some(at);
    }

    /// Clears the exhausted flag after a backoff increase has been applied.
    pub fn acknowledge(&self, provider: &str) {
        if let Some(mut e) = self.inner.get_mut(provider) {
            e.exhausted_at = None;
        }
    }

    pub fn get(&self, provider: &str) -> ThrottleState {
        self.inner.get(provider).map(|e| *e).unwrap_or_default()
    }
}
