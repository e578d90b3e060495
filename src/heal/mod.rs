// src/heal/mod.rs
//! # Auto-Healer
//!
//! `heal(issue)` picks the most specific matching strategy and runs its action under
//! a timeout. Per target:
//! - at most one action in flight (healing is serialized per target)
//! - at least `cooldown` between attempts
//! - at most `max_attempts` attempts per strategy, after which the target stays
//!   exhausted until health recovers or an operator resets it
//!
//! Whether an attempt actually fixed anything is decided by the next health probe,
//! reported back through [`Healer::resolve`].

pub mod actions;
pub mod cooldown;
pub mod strategy;

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::clock::SharedClock;
use crate::escalation::{AttemptOutcome, HealingAttempt};
use crate::issue::{Issue, Target};

pub use actions::{restarters_from_cfg, ActionContext, CommandRestarter, Restarter};
pub use cooldown::Cooldown;
pub use strategy::{HealingStrategy, StrategyBook};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("heal_attempts_total", "Healing actions run, by strategy and outcome.");
    });
}

/// What the healer did with an issue.
#[derive(Debug, Clone, PartialEq)]
pub enum HealDecision {
    /// An action ran; `outcome` is `applied`, `failed` or `timed-out`.
    Accepted {
        strategy: String,
        attempt: u32,
        max_attempts: u32,
        outcome: AttemptOutcome,
    },
    CoolingDown { until: DateTime<Utc> },
    /// Another action on the same target is still running.
    InFlight,
    /// Budget spent. Carries the full attempt history for escalation.
    Exhausted { attempts: Vec<HealingAttempt> },
    /// Nothing knows how to heal this; escalate.
    NoStrategy,
}

#[derive(Debug, Default)]
struct TargetState {
    attempts: Vec<HealingAttempt>,
    cooldown: Cooldown,
    in_flight: bool,
    exhausted: bool,
}

impl TargetState {
    fn attempts_for(&self, strategy: &str) -> u32 {
        self.attempts.iter().filter(|a| a.strategy == strategy).count() as u32
    }

    /// An earlier action that the monitor did not confirm.
    fn mark_pending_unresolved(&mut self) {
        for a in self.attempts.iter_mut() {
            if a.outcome == AttemptOutcome::Applied {
                a.outcome = AttemptOutcome::Unresolved;
            }
        }
    }
}

pub struct Healer {
    book: StrategyBook,
    ctx: ActionContext,
    states: Mutex<HashMap<Target, TargetState>>,
    clock: SharedClock,
}

impl Healer {
    pub fn new(book: StrategyBook, ctx: ActionContext, clock: SharedClock) -> Self {
        ensure_metrics_described();
        Self {
            book,
            ctx,
            states: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn book(&self) -> &StrategyBook {
        &self.book
    }

    pub fn strategy_for(&self, issue: &Issue) -> Option<&HealingStrategy> {
        self.book.select(issue)
    }

    pub async fn heal(&self, issue: &Issue) -> HealDecision {
        let Some(strategy) = self.book.select(issue) else {
            tracing::warn!(target: "heal", issue = %issue.pattern(), "no healing strategy matches");
            return HealDecision::NoStrategy;
        };
        let now = self.clock.now();

        let attempt_no = {
            let mut states = self.states.lock();
            let st = states.entry(issue.target.clone()).or_default();
            if st.in_flight {
                return HealDecision::InFlight;
            }
            if st.exhausted || st.attempts_for(&strategy.name) >= strategy.max_attempts {
                st.mark_pending_unresolved();
                st.exhausted = true;
                return HealDecision::Exhausted {
                    attempts: st.attempts.clone(),
                };
            }
            if !st.cooldown.ready(strategy.cooldown, now) {
                let until = st.cooldown.ready_at(strategy.cooldown).unwrap_or(now);
                return HealDecision::CoolingDown { until };
            }
            st.mark_pending_unresolved();
            st.in_flight = true;
            st.attempts_for(&strategy.name) + 1
        };

        tracing::info!(
            target: "heal",
            target_id = %issue.target,
            strategy = %strategy.name,
            attempt = attempt_no,
            max_attempts = strategy.max_attempts,
            "healing attempt started"
        );
        let started_at = now;
        let run = tokio::time::timeout(strategy.timeout, self.ctx.run(strategy.action, &issue.target)).await;
        let (outcome, detail) = match run {
            Ok(Ok(d)) => (AttemptOutcome::Applied, Some(d)),
            Ok(Err(e)) => (AttemptOutcome::Failed, Some(format!("{e:#}"))),
            Err(_) => (
                AttemptOutcome::TimedOut,
                Some(format!("no result after {}s", strategy.timeout.as_secs())),
            ),
        };
        let finished_at = self.clock.now();

        counter!(
            "heal_attempts_total",
            "strategy" => strategy.name.clone(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
        tracing::info!(
            target: "heal",
            target_id = %issue.target,
            strategy = %strategy.name,
            attempt = attempt_no,
            %outcome,
            detail = detail.as_deref().unwrap_or(""),
            "healing attempt finished"
        );

        {
            let mut states = self.states.lock();
            let st = states.entry(issue.target.clone()).or_default();
            st.attempts.push(HealingAttempt {
                attempt: attempt_no,
                strategy: strategy.name.clone(),
                action: strategy.action,
                outcome,
                started_at,
                finished_at,
                detail,
            });
            st.cooldown.record_attempt(finished_at);
            st.in_flight = false;
        }

        HealDecision::Accepted {
            strategy: strategy.name.clone(),
            attempt: attempt_no,
            max_attempts: strategy.max_attempts,
            outcome,
        }
    }

    /// Health confirmed recovery: close out the target's history and return it.
    pub fn resolve(&self, target: &Target) -> Vec<HealingAttempt> {
        let Some(mut st) = self.states.lock().remove(target) else {
            return Vec::new();
        };
        if let Some(last) = st.attempts.last_mut() {
            if last.outcome == AttemptOutcome::Applied {
                last.outcome = AttemptOutcome::Resolved;
            }
        }
        if !st.attempts.is_empty() {
            tracing::info!(target: "heal", target_id = %target, attempts = st.attempts.len(), "target recovered");
        }
        st.attempts
    }

    /// Operator intervention: forget the target so automatic healing may start over.
    pub fn reset(&self, target: &Target) {
        if self.states.lock().remove(target).is_some() {
            tracing::info!(target: "heal", target_id = %target, "healing state reset");
        }
    }

    pub fn attempts(&self, target: &Target) -> Vec<HealingAttempt> {
        self.states
            .lock()
            .get(target)
            .map(|s| s.attempts.clone())
            .unwrap_or_default()
    }

    pub fn is_exhausted(&self, target: &Target) -> bool {
        self.states.lock().get(target).is_some_and(|s| s.exhausted)
    }
}
