// src/heal/actions.rs
//! Concrete remediation actions. Each returns a short detail string on success; the
//! healer decides what counts as an attempt.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::TieredCache;
use crate::clock::SharedClock;
use crate::config::{ActionKind, DependentCfg};
use crate::gate;
use crate::ingest::Orchestrator;
use crate::issue::Target;

/// Restarts one dependent process.
#[async_trait]
pub trait Restarter: Send + Sync {
    async fn restart(&self) -> Result<()>;
}

/// Runs a configured argv and requires a zero exit status.
#[derive(Debug, Clone)]
pub struct CommandRestarter {
    argv: Vec<String>,
}

impl CommandRestarter {
    pub fn new(argv: Vec<String>) -> Option<Self> {
        (!argv.is_empty()).then_some(Self { argv })
    }
}

#[async_trait]
impl Restarter for CommandRestarter {
    async fn restart(&self) -> Result<()> {
        let (prog, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("empty restart command"))?;
        let status = tokio::process::Command::new(prog)
            .args(args)
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("spawn restart command {prog}"))?;
        if !status.success() {
            bail!("restart command {prog} exited with {status}");
        }
        Ok(())
    }
}

pub fn restarters_from_cfg(deps: &[DependentCfg]) -> HashMap<String, Arc<dyn Restarter>> {
    deps.iter()
        .filter_map(|d| {
            CommandRestarter::new(d.restart.clone()).map(|r| (d.name.clone(), Arc::new(r) as Arc<dyn Restarter>))
        })
        .collect()
}

/// Everything healing actions are allowed to touch.
pub struct ActionContext {
    pub orchestrator: Orchestrator,
    pub cache: Arc<TieredCache>,
    pub restarters: HashMap<String, Arc<dyn Restarter>>,
    pub success_threshold: f64,
    pub clock: SharedClock,
}

impl ActionContext {
    pub async fn run(&self, action: ActionKind, target: &Target) -> Result<String> {
        match (action, target) {
            (ActionKind::Refetch, Target::CacheKey(key)) => self.refetch_and_repair(key).await,
            (ActionKind::RestoreFromDurable, Target::CacheKey(key)) => {
                if self.cache.restore_from_durable(key).await {
                    Ok(format!("restored {key} from durable tier"))
                } else {
                    bail!("durable tier has no entry for {key}")
                }
            }
            (ActionKind::RestartDependent, Target::Dependent(name)) => {
                let r = self
                    .restarters
                    .get(name)
                    .ok_or_else(|| anyhow!("no restart command configured for {name}"))?;
                r.restart().await?;
                Ok(format!("restarted {name}"))
            }
            (ActionKind::BackoffIncrease, Target::Provider(p)) => {
                let delay = self
                    .orchestrator
                    .registry()
                    .limits()
                    .increase_delay(p)
                    .await
                    .ok_or_else(|| anyhow!("delay for {p} already at cap or provider unknown"))?;
                self.orchestrator.throttle().acknowledge(p);
                Ok(format!("{p} extra delay now {delay}ms"))
            }
            (ActionKind::EvictExpired, _) => {
                let n = self.cache.evict_expired().await;
                Ok(format!("evicted {n} expired entries"))
            }
            (action, target) => bail!("action {action:?} does not apply to {target}"),
        }
    }

    /// Re-fetch one source, score it on its own, write through on pass. On failure the
    /// fast tier is at least repaired from the durable copy so readers keep getting a
    /// stale-marked value.
    async fn refetch_and_repair(&self, key: &str) -> Result<String> {
        let registry = self.orchestrator.registry();
        let source = registry
            .get(key)
            .ok_or_else(|| anyhow!("{key} is not a registered source"))?
            .clone();
        let result = self
            .orchestrator
            .refetch(key)
            .await
            .ok_or_else(|| anyhow!("{key} is not a registered source"))?;

        let report = gate::evaluate(
            result.pass_id,
            std::slice::from_ref(&result),
            |_| source.is_critical(),
            self.success_threshold,
            self.clock.now(),
        )?;

        match (report.passed(), result.value) {
            (true, Some(value)) => {
                self.cache.write(key, value, Some(source.ttl)).await;
                Ok(format!(
                    "refetched {key} via {}",
                    result.provider_used.as_deref().unwrap_or("?")
                ))
            }
            _ => {
                let restored = self.cache.restore_from_durable(key).await;
                bail!(
                    "refetch of {key} failed ({}); durable copy {}",
                    result.error.as_deref().unwrap_or("no value"),
                    if restored { "restored" } else { "missing" }
                )
            }
        }
    }
}
