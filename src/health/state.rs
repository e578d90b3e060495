// src/health/state.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

use crate::issue::{Issue, Target};

/// Transitions kept per target for inspection.
const HISTORY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Healing,
    Failed,
}

impl HealthState {
    /// Gauge encoding.
    pub fn as_gauge(&self) -> f64 {
        match self {
            HealthState::Healthy => 0.0,
            HealthState::Degraded => 1.0,
            HealthState::Unhealthy => 2.0,
            HealthState::Healing => 3.0,
            HealthState::Failed => 4.0,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Healing => "healing",
            HealthState::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetHealth {
    pub target: Target,
    pub state: HealthState,
    pub since: DateTime<Utc>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_issue: Option<Issue>,
    pub history: VecDeque<Transition>,
}

impl TargetHealth {
    pub fn new(target: Target, at: DateTime<Utc>) -> Self {
        Self {
            target,
            state: HealthState::Healthy,
            since: at,
            last_probe_at: None,
            last_issue: None,
            history: VecDeque::new(),
        }
    }

    /// Move to `to`; no-op when already there.
    pub fn transition(&mut self, to: HealthState, at: DateTime<Utc>) {
        if self.state == to {
            return;
        }
        tracing::info!(target: "health", target_id = %self.target, from = %self.state, to = %to, "health transition");
        self.history.push_back(Transition {
            from: self.state,
            to,
            at,
        });
        while self.history.len() > HISTORY {
            self.history.pop_front();
        }
        self.state = to;
        self.since = at;
    }

    /// States visited, oldest first, starting from the initial state.
    pub fn path(&self) -> Vec<HealthState> {
        let mut out = Vec::with_capacity(self.history.len() + 1);
        match self.history.front() {
            Some(t) => out.push(t.from),
            None => out.push(self.state),
        }
        out.extend(self.history.iter().map(|t| t.to));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_records_each_step_once() {
        let now = Utc::now();
        let mut h = TargetHealth::new(Target::CacheKey("VIX".into()), now);
        h.transition(HealthState::Degraded, now);
        h.transition(HealthState::Degraded, now);
        h.transition(HealthState::Unhealthy, now);
        assert_eq!(
            h.path(),
            vec![HealthState::Healthy, HealthState::Degraded, HealthState::Unhealthy]
        );
        assert_eq!(h.state.as_gauge(), 2.0);
    }
}
