// tests/common/mod.rs
//
// Shared fixtures: a provider driven by a per-series script, a TOML settings builder
// that keeps everything in memory, and a supervisor on a manual clock.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use feed_gate::clock::{ManualClock, SharedClock};
use feed_gate::config::{self, Settings};
use feed_gate::error::FetchError;
use feed_gate::escalation::MemorySink;
use feed_gate::ingest::providers::ProviderSet;
use feed_gate::ingest::types::{DataProvider, SourceRequest};
use feed_gate::Supervisor;

pub const PROVIDER: &str = "scripted";

/// Answers from a queue per series; once a queue is drained it falls back to the
/// series default (success) or a permanent error when there is none. Series can be
/// made slow, and the highest number of concurrent fetches is tracked.
pub struct ScriptedProvider {
    id: String,
    queues: Mutex<HashMap<String, VecDeque<Result<Value, FetchError>>>>,
    defaults: Mutex<HashMap<String, Value>>,
    calls: Mutex<HashMap<String, u32>>,
    delays: Mutex<HashMap<String, Duration>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Decrements the in-flight count even when the fetch is cancelled.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            queues: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Every fetch of `series` takes `d` before answering.
    pub fn set_delay(&self, series: &str, d: Duration) {
        self.delays.lock().insert(series.to_string(), d);
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn ok(self, series: &str, v: Value) -> Self {
        self.defaults.lock().insert(series.to_string(), v);
        self
    }

    pub fn push(&self, series: &str, r: Result<Value, FetchError>) {
        self.queues.lock().entry(series.to_string()).or_default().push_back(r);
    }

    pub fn fail_times(&self, series: &str, n: usize) {
        for _ in 0..n {
            self.push(series, Err(FetchError::Permanent("scripted failure".into())));
        }
    }

    pub fn set_default(&self, series: &str, v: Option<Value>) {
        let mut d = self.defaults.lock();
        match v {
            Some(v) => d.insert(series.to_string(), v),
            None => d.remove(series),
        };
    }

    pub fn calls(&self, series: &str) -> u32 {
        self.calls.lock().get(series).copied().unwrap_or(0)
    }
}

#[async_trait]
impl DataProvider for ScriptedProvider {
    async fn fetch(&self, req: &SourceRequest) -> Result<Value, FetchError> {
        *self.calls.lock().entry(req.series.clone()).or_insert(0) += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);
        let delay = self.delays.lock().get(&req.series).copied();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if let Some(r) = self.queues.lock().get_mut(&req.series).and_then(|q| q.pop_front()) {
            return r;
        }
        self.defaults
            .lock()
            .get(&req.series)
            .cloned()
            .ok_or_else(|| FetchError::Permanent(format!("no script for '{}'", req.series)))
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// Two sources by default: `CORE` (critical) and `AUX` (standard), both on the scripted
/// provider, 60s TTL, no persistence, short cooldowns.
pub fn settings(extra: &str) -> Settings {
    let base = format!(
        r#"
[gate]
success_threshold = 0.5
pass_timeout_secs = 30

[orchestrator]
retry_attempts = 2
base_delay_ms = 10
request_timeout_secs = 5
backoff_step_ms = 100
backoff_factor = 2.0
max_extra_delay_ms = 10000

[cache]
default_ttl_secs = 60
repair_ttl_secs = 30

[health]
interval_secs = 10
unhealthy_factor = 2.0
probe_timeout_secs = 5

[escalation]
default_threshold = 5
default_window_secs = 600

[[providers]]
id = "{PROVIDER}"
kind = "static"
requests = 1000
window_secs = 1

[[sources]]
id = "CORE"
category = "economic"
criticality = "critical"
primary = "{PROVIDER}"
ttl_secs = 60

[[sources]]
id = "AUX"
category = "price"
primary = "{PROVIDER}"
ttl_secs = 60

[[healing.strategies]]
name = "refetch-and-repair"
kinds = ["stale-cache"]
action = "refetch"
max_attempts = 3
cooldown_secs = 10
timeout_secs = 5

[[healing.strategies]]
name = "backoff-increase"
kinds = ["rate-limited"]
action = "backoff-increase"
max_attempts = 3
cooldown_secs = 10
timeout_secs = 5
{extra}
"#
    );
    let mut s = config::parse_settings(&base, "toml").expect("test settings parse");
    s.cache.durable_path = None;
    s.orchestrator.rate_limit_state_path = None;
    s
}

pub fn manual_clock() -> (ManualClock, SharedClock) {
    let c = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 14, 0, 0).unwrap());
    let shared: SharedClock = Arc::new(c.clone());
    (c, shared)
}

pub struct Harness {
    pub sup: Supervisor,
    pub provider: Arc<ScriptedProvider>,
    pub sink: MemorySink,
    pub clock: ManualClock,
}

pub async fn harness(settings: Settings, provider: ScriptedProvider) -> Harness {
    let provider = Arc::new(provider);
    let mut set: ProviderSet = HashMap::new();
    set.insert(PROVIDER.to_string(), provider.clone() as Arc<dyn DataProvider>);
    let sink = MemorySink::new();
    let (clock, shared) = manual_clock();
    let sup = Supervisor::build_with(settings, set, Arc::new(sink.clone()), shared)
        .await
        .expect("supervisor builds");
    Harness {
        sup,
        provider,
        sink,
        clock,
    }
}

pub fn healthy_provider() -> ScriptedProvider {
    ScriptedProvider::new(PROVIDER)
        .ok("CORE", json!(4.21))
        .ok("AUX", json!(571.3))
}
