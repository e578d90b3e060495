// src/ingest/scheduler.rs
//! Pass pipeline: fetch every source, score the pass, write accepted values through the
//! cache, then publish readiness. The scheduled loop just repeats it.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cache::TieredCache;
use crate::clock::SharedClock;
use crate::error::GateError;
use crate::gate::{ReadinessGate, ValidationGate, ValidationReport};
use crate::ingest::Orchestrator;

pub struct Pipeline {
    orchestrator: Orchestrator,
    gate: ValidationGate,
    readiness: Arc<ReadinessGate>,
    cache: Arc<TieredCache>,
    clock: SharedClock,
}

impl Pipeline {
    pub fn new(
        orchestrator: Orchestrator,
        gate: ValidationGate,
        readiness: Arc<ReadinessGate>,
        cache: Arc<TieredCache>,
        clock: SharedClock,
    ) -> Self {
        Self {
            orchestrator,
            gate,
            readiness,
            cache,
            clock,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// One full pass. Cache writes happen only for sources that succeeded in an
    /// accepted pass, and sources that failed in it lose their fast-tier copy. Readiness
    /// is published after the fast tier is updated.
    pub async fn run_once(&self) -> Result<ValidationReport, GateError> {
        let outcome = self.orchestrator.run_pass().await;
        let report = self
            .gate
            .validate(outcome.pass_id, &outcome.results, self.clock.now())?;

        if report.passed() {
            let registry = self.orchestrator.registry();
            let mut written = 0usize;
            for r in &outcome.results {
                if !report.source_passed(&r.source_id) {
                    continue;
                }
                let (Some(value), Some(source)) = (r.value.clone(), registry.get(&r.source_id)) else {
                    continue;
                };
                self.cache.write(&r.source_id, value, Some(source.ttl)).await;
                written += 1;
            }
            // A failed source keeps no fresh fast-tier copy; reads fall back to the
            // durable tier and come back stale, or unavailable.
            for id in &report.failed_sources {
                self.cache.expire(id).await;
            }
            tracing::info!(
                target: "ingest",
                pass_id = report.pass_id,
                written,
                degraded = report.failed_sources.len(),
                "accepted pass written to cache"
            );
        } else {
            tracing::warn!(
                target: "ingest",
                pass_id = report.pass_id,
                pass_rate = report.pass_rate,
                critical_failures = ?report.critical_failures,
                "pass rejected; cache left untouched"
            );
        }

        self.readiness.publish(report.clone());
        Ok(report)
    }
}

/// Run a pass immediately, then every `interval`. A pass that overruns delays the next
/// tick instead of stacking.
pub fn spawn_ingest_loop(pipeline: Arc<Pipeline>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = pipeline.run_once().await {
                tracing::error!(target: "ingest", error = %e, "ingestion pass could not be scored");
            }
        }
    })
}
