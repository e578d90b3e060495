//! # Validation Gate
//!
//! Scores one settled ingestion pass and publishes the readiness signal dependents
//! wait on. The decision rule is fixed:
//!
//! - `fail` if `pass_rate < success_threshold`
//! - `fail` if any critical source did not succeed
//! - `pass` otherwise
//!
//! The threshold is configuration (default 0.80), the rule itself is not.

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::GateError;
use crate::ingest::types::FetchResult;
use crate::registry::SourceRegistry;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_gauge!("gate_pass_rate", "Success ratio of the last scored pass.");
        describe_counter!("gate_decisions_total", "Gate decisions by outcome.");
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Pass,
    Fail,
}

/// Immutable outcome of one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub pass_id: u64,
    pub pass_rate: f64,
    pub successes: usize,
    pub total: usize,
    pub critical_failures: BTreeSet<String>,
    /// Every source that did not succeed (critical or not).
    pub failed_sources: BTreeSet<String>,
    pub decision: Decision,
    pub generated_at: DateTime<Utc>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.decision == Decision::Pass
    }

    /// True when the pass was accepted and this particular source delivered.
    pub fn source_passed(&self, source_id: &str) -> bool {
        self.passed() && !self.failed_sources.contains(source_id)
    }
}

/// Pure scoring function.
pub fn evaluate<F>(
    pass_id: u64,
    results: &[FetchResult],
    is_critical: F,
    success_threshold: f64,
    at: DateTime<Utc>,
) -> Result<ValidationReport, GateError>
where
    F: Fn(&str) -> bool,
{
    if results.is_empty() {
        return Err(GateError::EmptyPass);
    }
    let total = results.len();
    let successes = results.iter().filter(|r| r.is_success()).count();
    let pass_rate = successes as f64 / total as f64;

    let failed_sources: BTreeSet<String> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.source_id.clone())
        .collect();
    let critical_failures: BTreeSet<String> = failed_sources
        .iter()
        .filter(|id| is_critical(id))
        .cloned()
        .collect();

    let decision = if pass_rate >= success_threshold && critical_failures.is_empty() {
        Decision::Pass
    } else {
        Decision::Fail
    };

    Ok(ValidationReport {
        pass_id,
        pass_rate,
        successes,
        total,
        critical_failures,
        failed_sources,
        decision,
        generated_at: at,
    })
}

/// Registry-aware wrapper around [`evaluate`].
#[derive(Debug, Clone)]
pub struct ValidationGate {
    registry: Arc<SourceRegistry>,
    success_threshold: f64,
}

impl ValidationGate {
    pub fn new(registry: Arc<SourceRegistry>, success_threshold: f64) -> Self {
        Self {
            registry,
            success_threshold,
        }
    }

    pub fn validate(
        &self,
        pass_id: u64,
        results: &[FetchResult],
        at: DateTime<Utc>,
    ) -> Result<ValidationReport, GateError> {
        let report = evaluate(
            pass_id,
            results,
            |id| self.registry.get(id).is_some_and(|s| s.is_critical()),
            self.success_threshold,
            at,
        )?;

        ensure_metrics_described();
        gauge!("gate_pass_rate").set(report.pass_rate);
        let label = match report.decision {
            Decision::Pass => "pass",
            Decision::Fail => "fail",
        };
        counter!("gate_decisions_total", "decision" => label).increment(1);
        tracing::info!(
            target: "gate",
            pass_id,
            pass_rate = report.pass_rate,
            critical_failures = ?report.critical_failures,
            decision = label,
            "validation decision recorded"
        );
        Ok(report)
    }
}

/// What dependents observe before serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Readiness {
    Pending,
    Pass { pass_id: u64 },
    Fail { pass_id: u64 },
}

impl Readiness {
    pub fn is_pass(&self) -> bool {
        matches!(self, Readiness::Pass { .. })
    }

    fn pass_id(&self) -> Option<u64> {
        match self {
            Readiness::Pending => None,
            Readiness::Pass { pass_id } | Readiness::Fail { pass_id } => Some(*pass_id),
        }
    }
}

/// Readiness signal: published exactly once per pass, in pass order.
#[derive(Debug)]
pub struct ReadinessGate {
    tx: watch::Sender<Readiness>,
    last_report: RwLock<Option<Arc<ValidationReport>>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Readiness::Pending);
        Self {
            tx,
            last_report: RwLock::new(None),
        }
    }

    /// Record a pass decision. Returns false (and changes nothing) when this pass, or a
    /// later one, was already published.
    pub fn publish(&self, report: ValidationReport) -> bool {
        if let Some(prev) = self.tx.borrow().pass_id() {
            if report.pass_id <= prev {
                tracing::debug!(target: "gate", pass_id = report.pass_id, "readiness already published for this pass");
                return false;
            }
        }
        let next = match report.decision {
            Decision::Pass => Readiness::Pass {
                pass_id: report.pass_id,
            },
            Decision::Fail => Readiness::Fail {
                pass_id: report.pass_id,
            },
        };
        *self.last_report.write() = Some(Arc::new(report));
        self.tx.send_replace(next);
        true
    }

    pub fn current(&self) -> Readiness {
        *self.tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.current().is_pass()
    }

    pub fn last_report(&self) -> Option<Arc<ValidationReport>> {
        self.last_report.read().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Readiness> {
        self.tx.subscribe()
    }

    /// Wait until some pass is accepted; returns its id.
    pub async fn wait_ready(&self) -> u64 {
        let mut rx = self.subscribe();
        loop {
            if let Readiness::Pass { pass_id } = *rx.borrow_and_update() {
                return pass_id;
            }
            if rx.changed().await.is_err() {
                // Sender lives as long as `self`; unreachable while borrowed.
                return 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::FetchOutcome;

    fn r(id: &str, ok: bool) -> FetchResult {
        FetchResult {
            source_id: id.into(),
            pass_id: 1,
            attempt: 1,
            outcome: if ok {
                FetchOutcome::Success
            } else {
                FetchOutcome::Failure
            },
            value: ok.then(|| serde_json::json!(1.0)),
            fetched_at: Utc::now(),
            latency_ms: 1,
            provider_used: Some("p".into()),
            error: None,
        }
    }

    #[test]
    fn empty_pass_is_an_error() {
        let e = evaluate(1, &[], |_| false, 0.8, Utc::now()).unwrap_err();
        assert_eq!(e, GateError::EmptyPass);
    }

    #[test]
    fn exactly_at_threshold_passes() {
        let rs: Vec<_> = (0..10).map(|i| r(&format!("S{i}"), i < 8)).collect();
        let rep = evaluate(1, &rs, |_| false, 0.8, Utc::now()).unwrap();
        assert_eq!(rep.pass_rate, 0.8);
        assert_eq!(rep.decision, Decision::Pass);
    }

    #[test]
    fn timeout_on_critical_source_fails() {
        let mut rs: Vec<_> = (0..10).map(|i| r(&format!("S{i}"), true)).collect();
        rs[0].outcome = FetchOutcome::Timeout;
        let rep = evaluate(1, &rs, |id| id == "S0", 0.8, Utc::now()).unwrap();
        assert_eq!(rep.decision, Decision::Fail);
        assert!(rep.critical_failures.contains("S0"));
    }

    #[test]
    fn readiness_is_published_once_per_pass() {
        let g = ReadinessGate::new();
        assert_eq!(g.current(), Readiness::Pending);
        let rep = evaluate(3, &[r("A", true)], |_| false, 0.8, Utc::now()).unwrap();
        assert!(g.publish(rep.clone()));
        assert!(!g.publish(rep.clone()));
        let older = ValidationReport { pass_id: 2, ..rep };
        assert!(!g.publish(older));
        assert_eq!(g.current(), Readiness::Pass { pass_id: 3 });
    }

    #[tokio::test]
    async fn wait_ready_resolves_after_pass() {
        let g = Arc::new(ReadinessGate::new());
        let g2 = Arc::clone(&g);
        let waiter = tokio::spawn(async move { g2.wait_ready().await });

        let fail = evaluate(1, &[r("A", false)], |_| false, 0.8, Utc::now()).unwrap();
        g.publish(fail);
        let ok = evaluate(2, &[r("A", true)], |_| false, 0.8, Utc::now()).unwrap();
        g.publish(ok);

        assert_eq!(waiter.await.unwrap(), 2);
    }
}
