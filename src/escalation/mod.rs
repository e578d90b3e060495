// src/escalation/mod.rs
//! # Escalation Engine
//!
//! One sliding-window [`AlertCounter`] per alert pattern. When a counter trips, or the
//! healer gives up on a target, an [`Incident`] is opened and handed to the configured
//! [`EscalationSink`]. At most one incident is open per pattern: repeated triggers
//! update it in place.
//!
//! Sinks are invoked after internal locks are released.

pub mod counter;
pub mod discord;
pub mod email;
pub mod sink;
pub mod slack;

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::{ActionKind, EscalationCfg};
use crate::ingest::audit::AuditLog;
use crate::ingest::types::FetchResult;
use crate::issue::{AlertPattern, Issue, Target};

pub use counter::{AlertCounter, CounterView};
pub use sink::{EscalationSink, LogSink, MemorySink, SinkMux, WebhookSink};

/// Fetch results attached to an incident's context.
const CONTEXT_RESULTS: usize = 10;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("escalation_incidents_total", "Incidents opened, by issue kind.");
        describe_counter!("escalation_sink_errors_total", "Failed incident deliveries, by sink.");
        describe_gauge!("escalation_open_incidents", "Currently open incidents.");
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    /// Action completed; waiting for the next probe to confirm.
    Applied,
    /// Next probe confirmed recovery.
    Resolved,
    /// Action completed but the issue was still present afterwards.
    Unresolved,
    Failed,
    TimedOut,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AttemptOutcome::Applied => "applied",
            AttemptOutcome::Resolved => "resolved",
            AttemptOutcome::Unresolved => "unresolved",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::TimedOut => "timed-out",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingAttempt {
    pub attempt: u32,
    pub strategy: String,
    pub action: ActionKind,
    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentContext {
    pub target: Target,
    pub detail: String,
    pub recent_results: Vec<FetchResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub trigger_pattern: AlertPattern,
    pub context: IncidentContext,
    pub healing_attempts: Vec<HealingAttempt>,
    /// Automatic healing has stopped; an operator has to act.
    pub escalated: bool,
    /// Triggers folded into this incident.
    pub triggers: u32,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn open(
        pattern: AlertPattern,
        context: IncidentContext,
        healing_attempts: Vec<HealingAttempt>,
        escalated: bool,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            trigger_pattern: pattern,
            context,
            healing_attempts,
            escalated,
            triggers: 1,
            opened_at: at,
            updated_at: at,
            resolved_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// What one `record` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum Escalation {
    /// Counter below threshold; nothing opened.
    Counted { count: u32, threshold: u32 },
    Opened(Incident),
    Updated(Incident),
}

impl Escalation {
    pub fn incident(&self) -> Option<&Incident> {
        match self {
            Escalation::Counted { .. } => None,
            Escalation::Opened(i) | Escalation::Updated(i) => Some(i),
        }
    }
}

#[derive(Default)]
struct State {
    counters: HashMap<AlertPattern, AlertCounter>,
    open: HashMap<AlertPattern, Incident>,
    closed: VecDeque<Incident>,
}

pub struct EscalationEngine {
    cfg: EscalationCfg,
    state: Mutex<State>,
    sink: Arc<dyn EscalationSink>,
    audit: Option<Arc<AuditLog>>,
    clock: SharedClock,
}

impl EscalationEngine {
    pub fn new(cfg: EscalationCfg, sink: Arc<dyn EscalationSink>, clock: SharedClock) -> Self {
        ensure_metrics_described();
        Self {
            cfg,
            state: Mutex::new(State::default()),
            sink,
            audit: None,
            clock,
        }
    }

    /// Attach the fetch audit log so incidents carry recent results for their target.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    fn context_for(&self, issue: &Issue) -> IncidentContext {
        let recent_results = match (&self.audit, &issue.target) {
            (Some(audit), Target::CacheKey(id)) => audit.recent_matching(CONTEXT_RESULTS, |r| &r.source_id == id),
            (Some(audit), Target::Provider(p)) => {
                audit.recent_matching(CONTEXT_RESULTS, |r| r.provider_used.as_deref() == Some(p.as_str()))
            }
            _ => Vec::new(),
        };
        IncidentContext {
            target: issue.target.clone(),
            detail: issue.detail.clone(),
            recent_results,
        }
    }

    /// Open a new incident for the pattern or fold this trigger into the open one.
    /// Returns the incident, whether it was newly opened, and whether the sink should
    /// hear about it.
    fn open_or_update(
        &self,
        st: &mut State,
        issue: &Issue,
        attempts: &[HealingAttempt],
        escalated: bool,
        now: DateTime<Utc>,
    ) -> (Incident, bool, bool) {
        let pattern = issue.pattern();
        if let Some(inc) = st.open.get_mut(&pattern) {
            let newly_escalated = escalated && !inc.escalated;
            inc.escalated |= escalated;
            inc.triggers += 1;
            inc.updated_at = now;
            inc.context = self.context_for(issue);
            if !attempts.is_empty() {
                inc.healing_attempts = attempts.to_vec();
            }
            tracing::info!(target: "escalation", incident = %inc.id, pattern = %pattern, triggers = inc.triggers, "open incident updated");
            return (inc.clone(), false, newly_escalated);
        }

        let inc = Incident::open(pattern.clone(), self.context_for(issue), attempts.to_vec(), escalated, now);
        counter!("escalation_incidents_total", "kind" => issue.kind.as_str()).increment(1);
        tracing::warn!(target: "escalation", incident = %inc.id, pattern = %pattern, escalated, "incident opened");
        st.open.insert(pattern, inc.clone());
        gauge!("escalation_open_incidents").set(st.open.len() as f64);
        (inc, true, true)
    }

    async fn emit(&self, incident: &Incident) {
        if let Err(e) = self.sink.notify(incident).await {
            tracing::error!(target: "escalation", incident = %incident.id, "incident delivery failed: {e:#}");
        }
    }

    /// Count one occurrence of the issue's pattern. Opens (or updates) an incident once
    /// the in-window count reaches the pattern's threshold.
    pub async fn record(&self, issue: &Issue, attempts: &[HealingAttempt]) -> Escalation {
        let now = self.clock.now();
        let pattern = issue.pattern();
        let (outcome, notify) = {
            let mut st = self.state.lock();
            let (threshold, window) = self.cfg.rule_for(issue.kind);
            let counter = st
                .counters
                .entry(pattern.clone())
                .or_insert_with(|| AlertCounter::new(pattern.clone(), threshold, window));
            let count = counter.record(now);
            let threshold = counter.threshold();
            tracing::debug!(target: "escalation", pattern = %pattern, count, threshold, "alert counted");
            if count >= threshold || st.open.contains_key(&pattern) {
                let (inc, opened, notify) = self.open_or_update(&mut st, issue, attempts, false, now);
                let outcome = if opened {
                    Escalation::Opened(inc)
                } else {
                    Escalation::Updated(inc)
                };
                (outcome, notify)
            } else {
                (Escalation::Counted { count, threshold }, false)
            }
        };
        if notify {
            if let Some(inc) = outcome.incident() {
                self.emit(inc).await;
            }
        }
        outcome
    }

    /// Escalate regardless of counters: healing budget exhausted, or nothing knows how
    /// to heal this pattern.
    pub async fn escalate(&self, issue: &Issue, attempts: &[HealingAttempt]) -> Incident {
        let now = self.clock.now();
        let (incident, _, notify) = {
            let mut st = self.state.lock();
            self.open_or_update(&mut st, issue, attempts, true, now)
        };
        if notify {
            self.emit(&incident).await;
        }
        incident
    }

    fn close(&self, st: &mut State, pattern: &AlertPattern, now: DateTime<Utc>) -> Option<Incident> {
        let mut inc = st.open.remove(pattern)?;
        inc.resolved_at = Some(now);
        inc.updated_at = now;
        st.closed.push_back(inc.clone());
        while st.closed.len() > self.cfg.closed_capacity.max(1) {
            st.closed.pop_front();
        }
        gauge!("escalation_open_incidents").set(st.open.len() as f64);
        tracing::info!(target: "escalation", incident = %inc.id, pattern = %pattern, "incident resolved");
        Some(inc)
    }

    /// Health confirmed the pattern is gone: reset its counter and close its incident.
    pub fn resolve(&self, pattern: &AlertPattern) -> Option<Incident> {
        let now = self.clock.now();
        let mut st = self.state.lock();
        if let Some(c) = st.counters.get_mut(pattern) {
            c.reset();
        }
        self.close(&mut st, pattern, now)
    }

    /// Close every open incident on a recovered target. Counters are reset only when
    /// a healing action did the recovering; otherwise they age out of their window.
    pub fn resolve_target(&self, target: &Target, healed: bool) -> Vec<Incident> {
        let now = self.clock.now();
        let mut st = self.state.lock();
        if healed {
            for (p, c) in st.counters.iter_mut() {
                if &p.target == target {
                    c.reset();
                }
            }
        }
        let patterns: Vec<AlertPattern> = st.open.keys().filter(|p| &p.target == target).cloned().collect();
        patterns
            .iter()
            .filter_map(|p| self.close(&mut st, p, now))
            .collect()
    }

    /// Operator marks an incident resolved by id.
    pub fn operator_resolve(&self, id: Uuid) -> Option<Incident> {
        let now = self.clock.now();
        let mut st = self.state.lock();
        let pattern = st.open.values().find(|i| i.id == id).map(|i| i.trigger_pattern.clone())?;
        if let Some(c) = st.counters.get_mut(&pattern) {
            c.reset();
        }
        self.close(&mut st, &pattern, now)
    }

    pub fn open_incidents(&self) -> Vec<Incident> {
        let mut v: Vec<Incident> = self.state.lock().open.values().cloned().collect();
        v.sort_by_key(|i| i.opened_at);
        v
    }

    pub fn open_for(&self, pattern: &AlertPattern) -> Option<Incident> {
        self.state.lock().open.get(pattern).cloned()
    }

    /// Most recently closed first.
    pub fn closed_incidents(&self, n: usize) -> Vec<Incident> {
        self.state.lock().closed.iter().rev().take(n).cloned().collect()
    }

    pub fn get(&self, id: Uuid) -> Option<Incident> {
        let st = self.state.lock();
        st.open
            .values()
            .chain(st.closed.iter())
            .find(|i| i.id == id)
            .cloned()
    }

    pub fn counters(&self) -> Vec<CounterView> {
        let now = self.clock.now();
        let mut st = self.state.lock();
        let mut v: Vec<CounterView> = st.counters.values_mut().map(|c| c.view(now)).collect();
        v.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        v
    }
}
