// src/ingest/mod.rs
//! Rate-limited fetch orchestrator. One task per source per pass, bounded by a global
//! concurrency cap and per-provider token buckets. Failures never escape as errors:
//! every source settles into exactly one `FetchResult`.

pub mod audit;
pub mod providers;
pub mod rate_limit;
pub mod scheduler;
pub mod throttle;
pub mod types;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::clock::SharedClock;
use crate::config::OrchestratorCfg;
use crate::error::FetchError;
use crate::registry::{Source, SourceRegistry};

use audit::AuditLog;
use providers::ProviderSet;
use rate_limit::ProviderLimiter;
use throttle::ThrottleStatus;
use types::{FetchOutcome, FetchResult, SourceRequest};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "ingest_fetch_attempts_total",
            "Provider requests issued, including retries and fallbacks."
        );
        describe_counter!(
            "ingest_fetch_failures_total",
            "Sources that settled without a value."
        );
        describe_counter!(
            "ingest_rate_limited_total",
            "Rate-limit responses received from providers."
        );
        describe_histogram!("ingest_fetch_latency_ms", "Provider request latency in milliseconds.");
        describe_gauge!(
            "ingest_pass_last_run_ts",
            "Unix ts when the last ingestion pass settled."
        );
    });
}

/// Everything one ingestion pass produced.
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub pass_id: u64,
    /// Exactly one settled result per registered source, in registry order.
    pub results: Vec<FetchResult>,
    /// Sources cut off by the pass timeout.
    pub unsettled: Vec<String>,
}

struct Inner {
    registry: Arc<SourceRegistry>,
    providers: ProviderSet,
    limiter: ProviderLimiter,
    throttle: Arc<ThrottleStatus>,
    audit: Arc<AuditLog>,
    cfg: OrchestratorCfg,
    clock: SharedClock,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
    pass_timeout: Duration,
    next_pass: Arc<AtomicU64>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<SourceRegistry>,
        providers: ProviderSet,
        cfg: OrchestratorCfg,
        pass_timeout: Duration,
        clock: SharedClock,
    ) -> Self {
        ensure_metrics_described();
        let audit = Arc::new(AuditLog::with_capacity(cfg.audit_capacity));
        Self {
            inner: Arc::new(Inner {
                registry,
                providers,
                limiter: ProviderLimiter::new(),
                throttle: Arc::new(ThrottleStatus::new()),
                audit,
                cfg,
                clock,
            }),
            pass_timeout,
            next_pass: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.inner.registry
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.inner.audit
    }

    pub fn throttle(&self) -> &Arc<ThrottleStatus> {
        &self.inner.throttle
    }

    fn allocate_pass_id(&self) -> u64 {
        self.next_pass.fetch_add(1, Ordering::Relaxed)
    }

    /// Run one ingestion pass over the whole registry.
    ///
    /// Returns once every task has settled or the pass timeout fires. On timeout the
    /// remaining tasks are aborted and their sources are scored as failures.
    pub async fn run_pass(&self) -> PassOutcome {
        let pass_id = self.allocate_pass_id();
        let inner = &self.inner;
        let sem = Arc::new(Semaphore::new(inner.cfg.max_concurrency.max(1)));
        let mut set = JoinSet::new();

        for source in inner.registry.sources() {
            let source = source.clone();
            let inner = Arc::clone(&self.inner);
            let sem = Arc::clone(&sem);
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                fetch_source(&inner, &source, pass_id).await
            });
        }

        let deadline = Instant::now() + self.pass_timeout;
        let mut settled: HashMap<String, FetchResult> = HashMap::with_capacity(inner.registry.len());
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(r))) => {
                    settled.insert(r.source_id.clone(), r);
                }
                Ok(Some(Err(e))) => {
                    tracing::error!(target: "ingest", pass_id, error = %e, "fetch task aborted");
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        target: "ingest",
                        pass_id,
                        pending = set.len(),
                        "pass timeout elapsed; cancelling unsettled fetches"
                    );
                    set.abort_all();
                    break;
                }
            }
        }

        let now = inner.clock.now();
        let mut unsettled = Vec::new();
        let results: Vec<FetchResult> = inner
            .registry
            .sources()
            .iter()
            .map(|s| match settled.remove(&s.id) {
                Some(r) => r,
                None => {
                    unsettled.push(s.id.clone());
                    FetchResult::unsettled(&s.id, pass_id, now)
                }
            })
            .collect();

        let failures = results.iter().filter(|r| !r.is_success()).count();
        counter!("ingest_fetch_failures_total").increment(failures as u64);
        gauge!("ingest_pass_last_run_ts").set(now.timestamp().max(0) as f64);
        tracing::info!(
            target: "ingest",
            pass_id,
            total = results.len(),
            failures,
            unsettled = unsettled.len(),
            "ingestion pass settled"
        );

        PassOutcome {
            pass_id,
            results,
            unsettled,
        }
    }

    /// Fetch a single registered source outside a scheduled pass (healing refetch).
    pub async fn refetch(&self, source_id: &str) -> Option<FetchResult> {
        let source = self.inner.registry.get(source_id)?.clone();
        let pass_id = self.allocate_pass_id();
        Some(fetch_source(&self.inner, &source, pass_id).await)
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.max(1))
}

/// Walk the source's provider chain with retries. Always settles.
async fn fetch_source(inner: &Inner, source: &Source, pass_id: u64) -> FetchResult {
    let req = SourceRequest {
        source_id: source.id.clone(),
        series: source.series.clone(),
    };
    let retries = inner.cfg.retry_attempts.max(1);
    let base = inner.cfg.base_delay();
    let max_wait = Duration::from_millis(inner.cfg.max_extra_delay_ms.max(inner.cfg.base_delay_ms));
    let limits = inner.registry.limits();

    let mut attempt_no: u32 = 0;
    let mut last_err: Option<FetchError> = None;
    let mut last_provider: Option<String> = None;
    let mut total_latency: u64 = 0;

    for provider_id in source.strategy.chain() {
        let Some(provider) = inner.providers.get(provider_id) else {
            tracing::warn!(target: "ingest", source = %source.id, provider = provider_id, "provider not configured; skipping");
            continue;
        };
        last_provider = Some(provider_id.to_string());
        let mut provider_err: Option<FetchError> = None;

        for attempt in 1..=retries {
            attempt_no += 1;
            inner.limiter.acquire(provider_id, limits).await;

            let started = Instant::now();
            let res = tokio::time::timeout(inner.cfg.request_timeout(), provider.fetch(&req))
                .await
                .unwrap_or(Err(FetchError::Timeout));
            let latency_ms = started.elapsed().as_millis() as u64;
            total_latency += latency_ms;
            let at = inner.clock.now();

            counter!("ingest_fetch_attempts_total").increment(1);
            histogram!("ingest_fetch_latency_ms").record(latency_ms as f64);

            match res {
                Ok(value) => {
                    inner.throttle.mark_ok(provider_id, at);
                    let result = FetchResult {
                        source_id: source.id.clone(),
                        pass_id,
                        attempt: attempt_no,
                        outcome: FetchOutcome::Success,
                        value: Some(value),
                        fetched_at: at,
                        latency_ms: total_latency,
                        provider_used: Some(provider_id.to_string()),
                        error: None,
                    };
                    inner.audit.push(FetchResult {
                        value: None,
                        latency_ms,
                        ..result.clone()
                    });
                    return result;
                }
                Err(e) => {
                    inner.audit.push(FetchResult {
                        source_id: source.id.clone(),
                        pass_id,
                        attempt: attempt_no,
                        outcome: if e == FetchError::Timeout {
                            FetchOutcome::Timeout
                        } else {
                            FetchOutcome::Failure
                        },
                        value: None,
                        fetched_at: at,
                        latency_ms,
                        provider_used: Some(provider_id.to_string()),
                        error: Some(e.to_string()),
                    });
                    tracing::debug!(target: "ingest", source = %source.id, provider = provider_id, attempt, error = %e, "fetch attempt failed");

                    let retryable = match &e {
                        FetchError::RateLimited { retry_after } => {
                            counter!("ingest_rate_limited_total").increment(1);
                            limits.increase_delay(provider_id).await;
                            let wait = retry_after.unwrap_or_default().max(backoff(base, attempt));
                            tokio::time::sleep(wait.min(max_wait)).await;
                            true
                        }
                        FetchError::Transient(_) | FetchError::Timeout => {
                            if attempt < retries {
                                tokio::time::sleep(backoff(base, attempt)).await;
                            }
                            true
                        }
                        FetchError::Permanent(_) => false,
                    };
                    provider_err = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        if let Some(e) = &provider_err {
            if e.is_rate_limited() {
                inner.throttle.mark_exhausted(provider_id, inner.clock.now());
            }
            tracing::info!(target: "ingest", source = %source.id, provider = provider_id, error = %e, "provider exhausted; trying next in chain");
        }
        last_err = provider_err;
    }

    let outcome = match last_err {
        Some(FetchError::Timeout) => FetchOutcome::Timeout,
        _ => FetchOutcome::Failure,
    };
    tracing::warn!(target: "ingest", source = %source.id, attempts = attempt_no, "source failed on every provider");
    FetchResult {
        source_id: source.id.clone(),
        pass_id,
        attempt: attempt_no,
        outcome,
        value: None,
        fetched_at: inner.clock.now(),
        latency_ms: total_latency,
        provider_used: last_provider,
        error: Some(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no configured provider".to_string()),
        ),
    }
}
