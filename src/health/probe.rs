// src/health/probe.rs
//! Probes: one per monitored target. A probe only observes; the monitor decides what
//! the observation means for the target's state.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::TieredCache;
use crate::clock::SharedClock;
use crate::config::Settings;
use crate::gate::{Readiness, ReadinessGate};
use crate::ingest::throttle::ThrottleStatus;
use crate::issue::{IssueKind, Target};
use crate::registry::SourceRegistry;

pub const RESOURCE_FAST_ENTRIES: &str = "fast-entries";
pub const RESOURCE_DURABLE_BACKLOG: &str = "durable-backlog";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Healthy,
    /// Age of the last validated write. A missing key reports `Duration::MAX`.
    Stale { age: Duration, ttl: Duration },
    Failing { kind: IssueKind, detail: String },
    /// Nothing to judge yet.
    Skipped,
}

#[async_trait]
pub trait Probe: Send + Sync {
    fn target(&self) -> Target;
    async fn check(&self) -> Observation;
}

/// Freshness of one cache key. Skipped until the first pass has been scored.
pub struct CacheKeyProbe {
    key: String,
    ttl: Duration,
    cache: Arc<TieredCache>,
    readiness: Arc<ReadinessGate>,
    clock: SharedClock,
}

impl CacheKeyProbe {
    pub fn new(
        key: String,
        ttl: Duration,
        cache: Arc<TieredCache>,
        readiness: Arc<ReadinessGate>,
        clock: SharedClock,
    ) -> Self {
        Self {
            key,
            ttl,
            cache,
            readiness,
            clock,
        }
    }
}

#[async_trait]
impl Probe for CacheKeyProbe {
    fn target(&self) -> Target {
        Target::CacheKey(self.key.clone())
    }

    async fn check(&self) -> Observation {
        if self.readiness.current() == Readiness::Pending {
            return Observation::Skipped;
        }
        match self.cache.inspect(&self.key).await {
            None => Observation::Stale {
                age: Duration::MAX,
                ttl: self.ttl,
            },
            Some(f) => {
                let age = (self.clock.now() - f.written_at).to_std().unwrap_or_default();
                if age > f.ttl {
                    Observation::Stale { age, ttl: f.ttl }
                } else {
                    Observation::Healthy
                }
            }
        }
    }
}

/// HTTP liveness of a dependent service: any 2xx is alive.
pub struct HttpLiveness {
    name: String,
    url: String,
    client: Client,
    timeout: Duration,
}

impl HttpLiveness {
    pub fn new(name: String, url: String, timeout: Duration) -> Self {
        Self {
            name,
            url,
            client: Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl Probe for HttpLiveness {
    fn target(&self) -> Target {
        Target::Dependent(self.name.clone())
    }

    async fn check(&self) -> Observation {
        let res = self.client.get(&self.url).timeout(self.timeout).send().await;
        match res {
            Ok(rsp) if rsp.status().is_success() => Observation::Healthy,
            Ok(rsp) => Observation::Failing {
                kind: IssueKind::DependentUnresponsive,
                detail: format!("{} answered {}", self.url, rsp.status()),
            },
            Err(e) => Observation::Failing {
                kind: IssueKind::DependentUnresponsive,
                detail: format!("{} unreachable: {e}", self.url),
            },
        }
    }
}

/// Reports a provider whose retries last ended on a rate-limit response.
pub struct ProviderThrottleProbe {
    provider: String,
    throttle: Arc<ThrottleStatus>,
}

impl ProviderThrottleProbe {
    pub fn new(provider: String, throttle: Arc<ThrottleStatus>) -> Self {
        Self { provider, throttle }
    }
}

#[async_trait]
impl Probe for ProviderThrottleProbe {
    fn target(&self) -> Target {
        Target::Provider(self.provider.clone())
    }

    async fn check(&self) -> Observation {
        match self.throttle.get(&self.provider).exhausted_at {
            Some(at) => Observation::Failing {
                kind: IssueKind::RateLimited,
                detail: format!("{} rate-limited every retry since {}", self.provider, at.to_rfc3339()),
            },
            None => Observation::Healthy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceMetric {
    FastEntries,
    DurableBacklog,
}

/// In-process resource threshold.
pub struct ResourceProbe {
    metric: ResourceMetric,
    limit: usize,
    cache: Arc<TieredCache>,
}

impl ResourceProbe {
    pub fn new(metric: ResourceMetric, limit: usize, cache: Arc<TieredCache>) -> Self {
        Self { metric, limit, cache }
    }
}

#[async_trait]
impl Probe for ResourceProbe {
    fn target(&self) -> Target {
        Target::Resource(
            match self.metric {
                ResourceMetric::FastEntries => RESOURCE_FAST_ENTRIES,
                ResourceMetric::DurableBacklog => RESOURCE_DURABLE_BACKLOG,
            }
            .to_string(),
        )
    }

    async fn check(&self) -> Observation {
        let value = match self.metric {
            ResourceMetric::FastEntries => self.cache.fast_len().await,
            ResourceMetric::DurableBacklog => self.cache.durable_backlog(),
        };
        if value > self.limit {
            Observation::Failing {
                kind: IssueKind::ResourcePressure,
                detail: format!("{} is {value}, limit {}", self.target().id(), self.limit),
            }
        } else {
            Observation::Healthy
        }
    }
}

/// Probe set for a configuration: every source key, every dependent, every provider,
/// plus the two resource thresholds.
pub fn build_probes(
    settings: &Settings,
    registry: &SourceRegistry,
    cache: &Arc<TieredCache>,
    throttle: &Arc<ThrottleStatus>,
    readiness: &Arc<ReadinessGate>,
    clock: &SharedClock,
) -> Vec<Arc<dyn Probe>> {
    let mut probes: Vec<Arc<dyn Probe>> = Vec::new();
    for s in registry.sources() {
        probes.push(Arc::new(CacheKeyProbe::new(
            s.id.clone(),
            s.ttl,
            Arc::clone(cache),
            Arc::clone(readiness),
            Arc::clone(clock),
        )));
    }
    let timeout = Duration::from_secs(settings.health.probe_timeout_secs.max(1));
    for d in &settings.dependents {
        probes.push(Arc::new(HttpLiveness::new(d.name.clone(), d.health_url.clone(), timeout)));
    }
    for p in &settings.providers {
        probes.push(Arc::new(ProviderThrottleProbe::new(p.id.clone(), Arc::clone(throttle))));
    }
    probes.push(Arc::new(ResourceProbe::new(
        ResourceMetric::FastEntries,
        settings.cache.max_fast_entries,
        Arc::clone(cache),
    )));
    probes.push(Arc::new(ResourceProbe::new(
        ResourceMetric::DurableBacklog,
        settings.cache.max_durable_backlog,
        Arc::clone(cache),
    )));
    probes
}
