// src/registry.rs
//! # Source Registry
//!
//! Static catalog of data sources loaded once from configuration. Everything here is
//! read-only at runtime except the per-provider rate-limit delay, which lives in a
//! [`RateLimitTable`] and is swapped atomically (never mutated in place).

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{OrchestratorCfg, Settings};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Price,
    Economic,
    Volatility,
    Credit,
    Fx,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    /// Failure blocks the whole pass.
    Critical,
    #[default]
    Standard,
}

/// Primary provider plus ordered fallbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStrategy {
    pub primary: String,
    pub fallbacks: Vec<String>,
}

impl FetchStrategy {
    pub fn chain(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub category: Category,
    pub criticality: Criticality,
    /// Provider-side series identifier.
    pub series: String,
    pub strategy: FetchStrategy,
    pub ttl: Duration,
}

impl Source {
    pub fn is_critical(&self) -> bool {
        self.criticality == Criticality::Critical
    }
}

/// Request budget for one provider. `extra_delay_ms` is the persisted backoff added
/// before every request after the provider has rate-limited us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests: u32,
    pub window_secs: u64,
    pub extra_delay_ms: u64,
}

impl RateLimit {
    pub fn extra_delay(&self) -> Duration {
        Duration::from_millis(self.extra_delay_ms)
    }
}

/// Shared rate-limit table. Readers take an `Arc` snapshot; writers clone, modify and
/// replace the whole map.
#[derive(Debug)]
pub struct RateLimitTable {
    snapshot: RwLock<Arc<HashMap<String, RateLimit>>>,
    path: Option<PathBuf>,
    write_guard: tokio::sync::Mutex<()>,
    step_ms: u64,
    factor: f64,
    max_ms: u64,
}

impl RateLimitTable {
    pub fn new(limits: HashMap<String, RateLimit>, cfg: &OrchestratorCfg) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(limits)),
            path: cfg.rate_limit_state_path.clone(),
            write_guard: tokio::sync::Mutex::new(()),
            step_ms: cfg.backoff_step_ms.max(1),
            factor: cfg.backoff_factor.max(1.0),
            max_ms: cfg.max_extra_delay_ms,
        }
    }

    /// Build from configured limits, overlaying delays persisted by earlier runs.
    pub fn open(limits: HashMap<String, RateLimit>, cfg: &OrchestratorCfg) -> Self {
        let mut limits = limits;
        if let Some(path) = &cfg.rate_limit_state_path {
            match std::fs::read_to_string(path) {
                Ok(s) => match serde_json::from_str::<HashMap<String, u64>>(&s) {
                    Ok(saved) => {
                        for (provider, delay) in saved {
                            if let Some(l) = limits.get_mut(&provider) {
                                l.extra_delay_ms = delay.min(cfg.max_extra_delay_ms);
                            }
                        }
                    }
                    Err(e) => tracing::warn!(target: "ingest", error = %e, "ignoring unreadable rate-limit state"),
                },
                Err(_) => {}
            }
        }
        Self::new(limits, cfg)
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, RateLimit>> {
        self.snapshot.read().clone()
    }

    pub fn get(&self, provider: &str) -> Option<RateLimit> {
        self.snapshot.read().get(provider).copied()
    }

    /// Raise the provider's persisted delay. Returns the new delay, or `None` when the
    /// provider is unknown or already at the cap.
    pub async fn increase_delay(&self, provider: &str) -> Option<u64> {
        let new_delay = {
            let mut guard = self.snapshot.write();
            let current = guard.get(provider).copied()?;
            if current.extra_delay_ms >= self.max_ms {
                return None;
            }
            let grown = (current.extra_delay_ms as f64 * self.factor) as u64;
            let next = grown.max(current.extra_delay_ms + self.step_ms).min(self.max_ms);
            let mut map = HashMap::clone(&guard);
            map.insert(
                provider.to_string(),
                RateLimit {
                    extra_delay_ms: next,
                    ..current
                },
            );
            *guard = Arc::new(map);
            next
        };
        tracing::info!(target: "ingest", provider, delay_ms = new_delay, "rate-limit delay increased");
        self.persist().await;
        Some(new_delay)
    }

    async fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let _w = self.write_guard.lock().await;
        let delays: HashMap<String, u64> = self
            .snapshot()
            .iter()
            .map(|(k, v)| (k.clone(), v.extra_delay_ms))
            .collect();
        let body = match serde_json::to_vec_pretty(&delays) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(target: "ingest", "serialize rate-limit state: {e:#}");
                return;
            }
        };
        if let Some(dir) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                tracing::warn!(target: "ingest", "rate-limit state dir: {e:#}");
            }
        }
        let tmp = path.with_extension("json.tmp");
        if let Err(e) = tokio::fs::write(&tmp, body).await {
            tracing::warn!(target: "ingest", "write rate-limit state: {e:#}");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            tracing::warn!(target: "ingest", "replace rate-limit state: {e:#}");
        }
    }
}

#[derive(Debug)]
pub struct SourceRegistry {
    sources: Vec<Source>,
    by_id: HashMap<String, usize>,
    limits: RateLimitTable,
}

impl SourceRegistry {
    pub fn new(sources: Vec<Source>, limits: RateLimitTable) -> Result<Self, ConfigError> {
        if sources.is_empty() {
            return Err(ConfigError::EmptyRegistry);
        }
        let mut by_id = HashMap::with_capacity(sources.len());
        for (i, s) in sources.iter().enumerate() {
            if by_id.insert(s.id.clone(), i).is_some() {
                return Err(ConfigError::DuplicateSource(s.id.clone()));
            }
        }
        Ok(Self {
            sources,
            by_id,
            limits,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let default_ttl = settings.cache.default_ttl_secs;
        let sources = settings
            .sources
            .iter()
            .map(|s| Source {
                id: s.id.clone(),
                category: s.category,
                criticality: s.criticality,
                series: s.series.clone().unwrap_or_else(|| s.id.clone()),
                strategy: FetchStrategy {
                    primary: s.primary.clone(),
                    fallbacks: s.fallbacks.clone(),
                },
                ttl: Duration::from_secs(s.ttl_secs.unwrap_or(default_ttl)),
            })
            .collect();
        let limits = settings
            .providers
            .iter()
            .map(|p| {
                (
                    p.id.clone(),
                    RateLimit {
                        requests: p.requests.max(1),
                        window_secs: p.window_secs.max(1),
                        extra_delay_ms: 0,
                    },
                )
            })
            .collect();
        Self::new(sources, RateLimitTable::open(limits, &settings.orchestrator))
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn get(&self, id: &str) -> Option<&Source> {
        self.by_id.get(id).map(|&i| &self.sources[i])
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn limits(&self) -> &RateLimitTable {
        &self.limits
    }

    /// Sources that fetch through `provider` (primary or fallback).
    pub fn sources_using<'a>(&'a self, provider: &'a str) -> impl Iterator<Item = &'a Source> + 'a {
        self.sources
            .iter()
            .filter(move |s| s.strategy.chain().any(|p| p == provider))
    }
}
