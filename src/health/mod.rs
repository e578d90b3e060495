// src/health/mod.rs
//! # Health Monitor
//!
//! Fixed-interval probe loop, independent of ingestion passes. Each target walks
//!
//! ```text
//! healthy -> degraded -> unhealthy -> healing -> healthy | failed
//! ```
//!
//! - staleness moves one step per probe: past `ttl` degrades, past
//!   `ttl * unhealthy_factor` (while degraded) is unhealthy
//! - a failing liveness, throttle or resource probe is unhealthy straight away
//! - unhealthy targets are handed to the healer; an accepted action means healing
//! - an exhausted budget, or an issue nothing can heal, fails the target and
//!   escalates exactly once
//! - any healthy probe returns the target to healthy and closes its incidents

pub mod probe;
pub mod state;

use metrics::{describe_gauge, gauge};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::config::HealthCfg;
use crate::escalation::{AttemptOutcome, EscalationEngine};
use crate::heal::{HealDecision, Healer};
use crate::issue::{Issue, IssueKind, Target};

pub use probe::{
    build_probes, CacheKeyProbe, HttpLiveness, Observation, Probe, ProviderThrottleProbe, ResourceMetric,
    ResourceProbe,
};
pub use state::{HealthState, TargetHealth, Transition};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_gauge!(
            "health_target_state",
            "0 healthy, 1 degraded, 2 unhealthy, 3 healing, 4 failed."
        );
    });
}

enum Verdict {
    Recovered,
    /// First step of staleness.
    Degrade(Issue),
    /// Staleness not yet past the second threshold.
    StillDegraded(Issue),
    Problem(Issue),
}

pub struct HealthMonitor {
    probes: Vec<Arc<dyn Probe>>,
    states: Mutex<HashMap<Target, TargetHealth>>,
    healer: Arc<Healer>,
    escalation: Arc<EscalationEngine>,
    interval: Duration,
    probe_timeout: Duration,
    unhealthy_factor: f64,
    clock: SharedClock,
}

impl HealthMonitor {
    pub fn new(
        probes: Vec<Arc<dyn Probe>>,
        healer: Arc<Healer>,
        escalation: Arc<EscalationEngine>,
        cfg: &HealthCfg,
        clock: SharedClock,
    ) -> Self {
        ensure_metrics_described();
        Self {
            probes,
            states: Mutex::new(HashMap::new()),
            healer,
            escalation,
            interval: Duration::from_secs(cfg.interval_secs.max(1)),
            probe_timeout: Duration::from_secs(cfg.probe_timeout_secs.max(1)),
            unhealthy_factor: cfg.unhealthy_factor.max(1.0),
            clock,
        }
    }

    /// Probe every target once and apply the resulting transitions.
    pub async fn tick(&self) {
        futures::future::join_all(self.probes.iter().map(|p| self.probe_one(p.as_ref()))).await;
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    fn current(&self, target: &Target) -> HealthState {
        let now = self.clock.now();
        let mut states = self.states.lock();
        let h = states
            .entry(target.clone())
            .or_insert_with(|| TargetHealth::new(target.clone(), now));
        h.last_probe_at = Some(now);
        h.state
    }

    fn set_state(&self, target: &Target, to: HealthState, issue: Option<Issue>) {
        let now = self.clock.now();
        let mut states = self.states.lock();
        let h = states
            .entry(target.clone())
            .or_insert_with(|| TargetHealth::new(target.clone(), now));
        h.transition(to, now);
        if issue.is_some() || to == HealthState::Healthy {
            h.last_issue = issue;
        }
        gauge!("health_target_state", "target" => target.to_string()).set(h.state.as_gauge());
    }

    fn second_threshold(&self, ttl: Duration) -> Duration {
        Duration::try_from_secs_f64(ttl.as_secs_f64() * self.unhealthy_factor).unwrap_or(Duration::MAX)
    }

    async fn probe_one(&self, probe: &dyn Probe) {
        let target = probe.target();
        let obs = match tokio::time::timeout(self.probe_timeout, probe.check()).await {
            Ok(o) => o,
            Err(_) => Observation::Failing {
                kind: IssueKind::Unknown,
                detail: format!("probe gave no answer within {}s", self.probe_timeout.as_secs()),
            },
        };
        if obs == Observation::Skipped {
            return;
        }

        let now = self.clock.now();
        let current = self.current(&target);
        let verdict = match obs {
            Observation::Healthy | Observation::Skipped => Verdict::Recovered,
            Observation::Stale { age, ttl } => {
                let detail = if age == Duration::MAX {
                    "no validated value cached".to_string()
                } else {
                    format!("age {}s exceeds ttl {}s", age.as_secs(), ttl.as_secs())
                };
                let issue = Issue::new(IssueKind::StaleCache, target.clone(), detail, now);
                match current {
                    HealthState::Healthy => Verdict::Degrade(issue),
                    HealthState::Degraded if age < self.second_threshold(ttl) => Verdict::StillDegraded(issue),
                    _ => Verdict::Problem(issue),
                }
            }
            Observation::Failing { kind, detail } => Verdict::Problem(Issue::new(kind, target.clone(), detail, now)),
        };

        match verdict {
            Verdict::Recovered => self.recover(&target, current),
            Verdict::Degrade(issue) | Verdict::StillDegraded(issue) => {
                self.set_state(&target, HealthState::Degraded, Some(issue));
            }
            Verdict::Problem(issue) => self.handle_problem(issue, current).await,
        }
    }

    fn recover(&self, target: &Target, current: HealthState) {
        match current {
            HealthState::Healthy => {}
            HealthState::Degraded => self.set_state(target, HealthState::Healthy, None),
            HealthState::Unhealthy | HealthState::Healing | HealthState::Failed => {
                let attempts = self.healer.resolve(target);
                let healed = attempts.iter().any(|a| a.outcome == AttemptOutcome::Resolved);
                self.escalation.resolve_target(target, healed);
                self.set_state(target, HealthState::Healthy, None);
            }
        }
    }

    async fn handle_problem(&self, issue: Issue, current: HealthState) {
        let target = issue.target.clone();
        match current {
            HealthState::Failed => {
                // Escalated already; nothing automatic until recovery or an operator reset.
                let mut states = self.states.lock();
                if let Some(h) = states.get_mut(&target) {
                    h.last_issue = Some(issue);
                }
                return;
            }
            HealthState::Healthy | HealthState::Degraded => {
                self.set_state(&target, HealthState::Unhealthy, Some(issue.clone()));
                self.escalation.record(&issue, &self.healer.attempts(&target)).await;
            }
            HealthState::Unhealthy | HealthState::Healing => {
                self.set_state(&target, current, Some(issue.clone()));
            }
        }

        match self.healer.heal(&issue).await {
            HealDecision::Accepted { .. } | HealDecision::InFlight => {
                self.set_state(&target, HealthState::Healing, None);
            }
            HealDecision::CoolingDown { until } => {
                tracing::debug!(target: "health", target_id = %target, until = %until, "healing cooling down");
            }
            HealDecision::Exhausted { attempts } => {
                self.set_state(&target, HealthState::Failed, None);
                self.escalation.escalate(&issue, &attempts).await;
            }
            HealDecision::NoStrategy => {
                self.set_state(&target, HealthState::Failed, None);
                self.escalation.escalate(&issue, &[]).await;
            }
        }
    }

    /// Operator intervention on a target: forget its health and healing state so the
    /// next probe starts from healthy.
    pub fn operator_reset(&self, target: &Target) {
        self.healer.reset(target);
        if self.states.lock().remove(target).is_some() {
            gauge!("health_target_state", "target" => target.to_string()).set(HealthState::Healthy.as_gauge());
            tracing::info!(target: "health", target_id = %target, "target reset by operator");
        }
    }

    pub fn state_of(&self, target: &Target) -> Option<HealthState> {
        self.states.lock().get(target).map(|h| h.state)
    }

    pub fn health_of(&self, target: &Target) -> Option<TargetHealth> {
        self.states.lock().get(target).cloned()
    }

    pub fn snapshot(&self) -> Vec<TargetHealth> {
        let mut v: Vec<TargetHealth> = self.states.lock().values().cloned().collect();
        v.sort_by(|a, b| a.target.cmp(&b.target));
        v
    }

    pub fn targets(&self) -> Vec<Target> {
        self.probes.iter().map(|p| p.target()).collect()
    }
}
