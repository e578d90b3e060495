//! # Alert Counter
//! Sliding window of trigger timestamps for one alert pattern.
//!
//! Only hits inside the window are kept, so `count` never exceeds what is observable
//! within it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

use crate::issue::AlertPattern;

#[derive(Debug, Clone)]
pub struct AlertCounter {
    pattern: AlertPattern,
    threshold: u32,
    window: ChronoDuration,
    hits: VecDeque<DateTime<Utc>>,
}

/// Read-only view for the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterView {
    pub pattern: AlertPattern,
    pub window_start: Option<DateTime<Utc>>,
    pub count: u32,
    pub threshold: u32,
}

impl AlertCounter {
    pub fn new(pattern: AlertPattern, threshold: u32, window: Duration) -> Self {
        Self {
            pattern,
            threshold: threshold.max(1),
            window: ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::days(365)),
            hits: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while let Some(&t) = self.hits.front() {
            if t <= cutoff {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    /// Count one trigger at `now`; returns the in-window count.
    pub fn record(&mut self, now: DateTime<Utc>) -> u32 {
        self.hits.push_back(now);
        self.prune(now);
        self.hits.len() as u32
    }

    pub fn count(&mut self, now: DateTime<Utc>) -> u32 {
        self.prune(now);
        self.hits.len() as u32
    }

    pub fn tripped(&mut self, now: DateTime<Utc>) -> bool {
        self.count(now) >= self.threshold
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn reset(&mut self) {
        self.hits.clear();
    }

    pub fn view(&mut self, now: DateTime<Utc>) -> CounterView {
        self.prune(now);
        CounterView {
            pattern: self.pattern.clone(),
            window_start: self.hits.front().copied(),
            count: self.hits.len() as u32,
            threshold: self.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{IssueKind, Target};

    fn pattern() -> AlertPattern {
        AlertPattern {
            kind: IssueKind::StaleCache,
            target: Target::CacheKey("VIX".into()),
        }
    }

    #[test]
    fn hits_age_out_of_the_window() {
        let mut c = AlertCounter::new(pattern(), 3, Duration::from_secs(60));
        let t0 = Utc::now();
        assert_eq!(c.record(t0), 1);
        assert_eq!(c.record(t0 + ChronoDuration::seconds(30)), 2);
        // first hit is exactly one window old now
        assert_eq!(c.record(t0 + ChronoDuration::seconds(60)), 2);
        assert!(!c.tripped(t0 + ChronoDuration::seconds(61)));
        assert_eq!(c.count(t0 + ChronoDuration::seconds(200)), 0);
    }

    #[test]
    fn trips_at_threshold_and_resets() {
        let mut c = AlertCounter::new(pattern(), 2, Duration::from_secs(60));
        let t0 = Utc::now();
        c.record(t0);
        c.record(t0 + ChronoDuration::seconds(1));
        assert!(c.tripped(t0 + ChronoDuration::seconds(2)));
        c.reset();
        assert_eq!(c.view(t0).count, 0);
        assert_eq!(c.view(t0).window_start, None);
    }
}
