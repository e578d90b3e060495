// src/supervisor.rs
//! Wires the components together and owns the two background loops: ingestion
//! passes and health probing. They share no lock, so a wedged pass never stalls
//! health checks.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::api::AppState;
use crate::cache::TieredCache;
use crate::clock::SharedClock;
use crate::config::{self, Settings};
use crate::escalation::{EscalationEngine, EscalationSink};
use crate::gate::{ReadinessGate, ValidationGate};
use crate::heal::{restarters_from_cfg, ActionContext, Healer, StrategyBook};
use crate::health::{build_probes, HealthMonitor};
use crate::ingest::providers::{build_providers, ProviderSet};
use crate::ingest::scheduler::{spawn_ingest_loop, Pipeline};
use crate::ingest::Orchestrator;
use crate::registry::SourceRegistry;

pub struct Supervisor {
    pub settings: Settings,
    pub registry: Arc<SourceRegistry>,
    pub pipeline: Arc<Pipeline>,
    pub readiness: Arc<ReadinessGate>,
    pub cache: Arc<TieredCache>,
    pub healer: Arc<Healer>,
    pub escalation: Arc<EscalationEngine>,
    pub monitor: Arc<HealthMonitor>,
    pub clock: SharedClock,
}

/// Background loop handles. Dropping them leaves the loops running; call `abort`.
pub struct Handles {
    pub ingest: JoinHandle<()>,
    pub health: JoinHandle<()>,
}

impl Handles {
    pub fn abort(&self) {
        self.ingest.abort();
        self.health.abort();
    }
}

impl Supervisor {
    /// Build with providers constructed from configuration.
    pub async fn build(settings: Settings, sink: Arc<dyn EscalationSink>, clock: SharedClock) -> Result<Self> {
        let providers = build_providers(&settings).context("building providers")?;
        Self::build_with(settings, providers, sink, clock).await
    }

    /// Build with an explicit provider set.
    pub async fn build_with(
        settings: Settings,
        providers: ProviderSet,
        sink: Arc<dyn EscalationSink>,
        clock: SharedClock,
    ) -> Result<Self> {
        config::validate(&settings)?;
        let registry = Arc::new(SourceRegistry::from_settings(&settings)?);

        let cache = Arc::new(
            TieredCache::from_cfg(&settings.cache, Arc::clone(&clock))
                .await
                .context("opening cache")?,
        );
        for a in &settings.aliases {
            cache.alias(&a.from, &a.to)?;
        }

        let orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            providers,
            settings.orchestrator.clone(),
            settings.gate.pass_timeout(),
            Arc::clone(&clock),
        );
        let readiness = Arc::new(ReadinessGate::new());
        let gate = ValidationGate::new(Arc::clone(&registry), settings.gate.success_threshold);

        let escalation = Arc::new(
            EscalationEngine::new(settings.escalation.clone(), sink, Arc::clone(&clock))
                .with_audit(Arc::clone(orchestrator.audit())),
        );

        let ctx = ActionContext {
            orchestrator: orchestrator.clone(),
            cache: Arc::clone(&cache),
            restarters: restarters_from_cfg(&settings.dependents),
            success_threshold: settings.gate.success_threshold,
            clock: Arc::clone(&clock),
        };
        let healer = Arc::new(Healer::new(
            StrategyBook::from_cfg(&settings.healing.strategies),
            ctx,
            Arc::clone(&clock),
        ));

        let probes = build_probes(
            &settings,
            &registry,
            &cache,
            orchestrator.throttle(),
            &readiness,
            &clock,
        );
        let monitor = Arc::new(HealthMonitor::new(
            probes,
            Arc::clone(&healer),
            Arc::clone(&escalation),
            &settings.health,
            Arc::clone(&clock),
        ));

        let pipeline = Arc::new(Pipeline::new(
            orchestrator,
            gate,
            Arc::clone(&readiness),
            Arc::clone(&cache),
            Arc::clone(&clock),
        ));

        tracing::info!(
            sources = registry.len(),
            critical = registry.sources().iter().filter(|s| s.is_critical()).count(),
            threshold = settings.gate.success_threshold,
            dependents = settings.dependents.len(),
            "feed-gate assembled"
        );

        Ok(Self {
            settings,
            registry,
            pipeline,
            readiness,
            cache,
            healer,
            escalation,
            monitor,
            clock,
        })
    }

    /// Spawn the ingestion and health loops.
    pub fn start(&self) -> Handles {
        let ingest = spawn_ingest_loop(
            Arc::clone(&self.pipeline),
            Duration::from_secs(self.settings.orchestrator.pass_interval_secs),
        );
        let health = Arc::clone(&self.monitor).spawn();
        Handles { ingest, health }
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            readiness: Arc::clone(&self.readiness),
            cache: Arc::clone(&self.cache),
            monitor: Arc::clone(&self.monitor),
            escalation: Arc::clone(&self.escalation),
        }
    }
}
