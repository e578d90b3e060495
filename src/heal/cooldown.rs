// src/heal/cooldown.rs
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Minimum spacing between healing attempts on one target.
/// - First attempt is always allowed.
/// - Inside the cooldown, attempts are refused.
/// - State only moves via `record_attempt`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cooldown {
    last_attempt_at: Option<DateTime<Utc>>,
}

impl Cooldown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Does not mutate state.
    pub fn ready(&self, cooldown: Duration, now: DateTime<Utc>) -> bool {
        match self.ready_at(cooldown) {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// When the next attempt becomes possible; `None` before the first attempt.
    pub fn ready_at(&self, cooldown: Duration) -> Option<DateTime<Utc>> {
        let last = self.last_attempt_at?;
        let cd = ChronoDuration::from_std(cooldown).unwrap_or_else(|_| ChronoDuration::days(365));
        Some(last + cd)
    }

    pub fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.last_attempt_at = Some(now);
    }

    pub fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.last_attempt_at
    }
}
