// src/cache/mod.rs
//! # Tiered Cache
//!
//! Validated values land in a fast tier and are mirrored to a durable tier by a
//! background writer, so the mirror never sits on the read path. Reads go
//! fast → durable (bounded by a timeout) → `Unavailable`. A durable hit repairs the
//! fast tier with a short-lived entry that keeps reading as stale until a fresh
//! validated write replaces it.

pub mod durable;
pub mod fast;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::clock::SharedClock;
use crate::config::CacheCfg;
use crate::error::CacheError;

pub use durable::{DurableTier, JsonLedger, MemoryDurable};
pub use fast::{FastTier, MemoryFastTier, SlotCheck};

/// Longest alias chain followed before giving up.
const MAX_ALIAS_DEPTH: usize = 8;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("cache_reads_total", "Cache reads by result (fast, durable, unavailable).");
        describe_counter!("cache_durable_errors_total", "Failed or timed-out durable-tier operations.");
        describe_gauge!("cache_durable_backlog", "Mirror writes queued for the durable tier.");
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    Durable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub written_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub tier: Tier,
    /// Fast-tier copy restored from the durable tier rather than freshly validated.
    #[serde(default)]
    pub restored: bool,
}

impl CacheEntry {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.written_at + ChronoDuration::seconds(self.ttl_secs.min(i64::MAX as u64 / 1_000) as i64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// A value served to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheHit {
    /// Underlying source key after alias resolution.
    pub key: String,
    /// The requested name, when it was an alias of `key`.
    pub alias_of: Option<String>,
    pub value: Value,
    pub written_at: DateTime<Utc>,
    pub stale: bool,
    pub tier: Tier,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CacheRead {
    Hit(CacheHit),
    /// Nothing trustworthy to serve. Callers must not substitute a default.
    Unavailable,
}

impl CacheRead {
    pub fn hit(&self) -> Option<&CacheHit> {
        match self {
            CacheRead::Hit(h) => Some(h),
            CacheRead::Unavailable => None,
        }
    }
}

/// Age information for the last validated write of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub written_at: DateTime<Utc>,
    pub ttl: Duration,
}

/// TTLs are kept at second resolution, rounded up so a sub-second TTL is not born expired.
fn whole_secs(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis().div_ceil(1_000)).unwrap_or(u64::MAX)
}

enum Mirror {
    Upsert(CacheEntry),
    Flush(oneshot::Sender<()>),
}

pub struct TieredCache {
    fast: Arc<dyn FastTier>,
    durable: Arc<dyn DurableTier>,
    aliases: RwLock<HashMap<String, String>>,
    mirror_tx: mpsc::UnboundedSender<Mirror>,
    backlog: Arc<AtomicUsize>,
    clock: SharedClock,
    default_ttl: Duration,
    repair_ttl: Duration,
    read_timeout: Duration,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("aliases", &self.aliases.read().len())
            .field("backlog", &self.durable_backlog())
            .finish()
    }
}

impl TieredCache {
    /// Must be called inside a Tokio runtime: spawns the durable mirror writer.
    pub fn new(
        fast: Arc<dyn FastTier>,
        durable: Arc<dyn DurableTier>,
        cfg: &CacheCfg,
        clock: SharedClock,
    ) -> Self {
        ensure_metrics_described();
        let (mirror_tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_mirror(rx, Arc::clone(&durable), Arc::clone(&backlog)));
        Self {
            fast,
            durable,
            aliases: RwLock::new(HashMap::new()),
            mirror_tx,
            backlog,
            clock,
            default_ttl: Duration::from_secs(cfg.default_ttl_secs),
            repair_ttl: Duration::from_secs(cfg.repair_ttl_secs.max(1)),
            read_timeout: Duration::from_millis(cfg.read_timeout_ms.max(1)),
        }
    }

    /// Fast tier in memory, durable tier from `cfg.durable_path` (in memory when unset).
    pub async fn from_cfg(cfg: &CacheCfg, clock: SharedClock) -> Result<Self, CacheError> {
        let durable: Arc<dyn DurableTier> = match &cfg.durable_path {
            Some(p) => Arc::new(JsonLedger::open(p).await?),
            None => Arc::new(MemoryDurable::new()),
        };
        Ok(Self::new(Arc::new(MemoryFastTier::new()), durable, cfg, clock))
    }

    fn resolve(&self, key: &str) -> String {
        let aliases = self.aliases.read();
        let mut cur = key;
        for _ in 0..MAX_ALIAS_DEPTH {
            match aliases.get(cur) {
                Some(next) => cur = next.as_str(),
                None => break,
            }
        }
        cur.to_string()
    }

    /// Map a consumer-facing name onto a source key. No data is copied.
    pub fn alias(&self, from: &str, to: &str) -> Result<(), CacheError> {
        let mut aliases = self.aliases.write();
        let cycle = || CacheError::AliasCycle {
            from: from.to_string(),
            to: to.to_string(),
        };
        if from == to {
            return Err(cycle());
        }
        let mut cur = to;
        let mut depth = 1;
        while let Some(next) = aliases.get(cur) {
            if next == from {
                return Err(cycle());
            }
            depth += 1;
            if depth >= MAX_ALIAS_DEPTH {
                return Err(cycle());
            }
            cur = next.as_str();
        }
        aliases.insert(from.to_string(), to.to_string());
        tracing::debug!(target: "cache", from, to, "alias registered");
        Ok(())
    }

    pub fn aliases(&self) -> HashMap<String, String> {
        self.aliases.read().clone()
    }

    /// Store a validated value. The durable mirror is queued, never awaited.
    pub async fn write(&self, key: &str, value: Value, ttl: Option<Duration>) -> CacheEntry {
        let key = self.resolve(key);
        let entry = CacheEntry {
            key,
            value,
            written_at: self.clock.now(),
            ttl_secs: whole_secs(ttl.unwrap_or(self.default_ttl)),
            tier: Tier::Fast,
            restored: false,
        };
        self.fast.set(entry.clone()).await;
        self.queue_mirror(CacheEntry {
            tier: Tier::Durable,
            ..entry.clone()
        });
        entry
    }

    fn queue_mirror(&self, entry: CacheEntry) {
        let depth = self.backlog.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("cache_durable_backlog").set(depth as f64);
        if self.mirror_tx.send(Mirror::Upsert(entry)).is_err() {
            self.backlog.fetch_sub(1, Ordering::Relaxed);
            counter!("cache_durable_errors_total").increment(1);
            tracing::warn!(target: "cache", "durable mirror writer is gone; entry kept in fast tier only");
        }
    }

    /// Fast tier, then durable tier, then `Unavailable`. Never waits longer than the
    /// configured read timeout per tier.
    pub async fn read(&self, key: &str) -> CacheRead {
        let resolved = self.resolve(key);
        let alias_of = (resolved != key).then(|| key.to_string());
        let now = self.clock.now();

        match tokio::time::timeout(self.read_timeout, self.fast.get(&resolved)).await {
            Ok(Some(e)) if !e.is_expired(now) => {
                counter!("cache_reads_total", "result" => "fast").increment(1);
                return CacheRead::Hit(CacheHit {
                    key: resolved,
                    alias_of,
                    value: e.value,
                    written_at: e.written_at,
                    stale: e.restored,
                    tier: Tier::Fast,
                });
            }
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(target: "cache", key = %resolved, "fast tier read timed out");
            }
        }

        match self.durable_lookup(&resolved).await {
            Some(e) => {
                if !self.repair(&e).await {
                    // A validated write landed while the durable tier was being read.
                    if let Ok(Some(fresh)) = tokio::time::timeout(self.read_timeout, self.fast.get(&resolved)).await {
                        if !fresh.is_expired(self.clock.now()) {
                            counter!("cache_reads_total", "result" => "fast").increment(1);
                            return CacheRead::Hit(CacheHit {
                                key: resolved,
                                alias_of,
                                value: fresh.value,
                                written_at: fresh.written_at,
                                stale: fresh.restored,
                                tier: Tier::Fast,
                            });
                        }
                    }
                }
                counter!("cache_reads_total", "result" => "durable").increment(1);
                CacheRead::Hit(CacheHit {
                    key: resolved,
                    alias_of,
                    value: e.value,
                    written_at: e.written_at,
                    stale: true,
                    tier: Tier::Durable,
                })
            }
            None => {
                counter!("cache_reads_total", "result" => "unavailable").increment(1);
                CacheRead::Unavailable
            }
        }
    }

    async fn durable_lookup(&self, key: &str) -> Option<CacheEntry> {
        match tokio::time::timeout(self.read_timeout, self.durable.get(key)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                counter!("cache_durable_errors_total").increment(1);
                tracing::warn!(target: "cache", key, error = %e, "durable tier read failed");
                None
            }
            Err(_) => {
                counter!("cache_durable_errors_total").increment(1);
                tracing::warn!(target: "cache", key, timeout_ms = self.read_timeout.as_millis() as u64, "durable tier read timed out");
                None
            }
        }
    }

    /// Put a durable copy back into the fast tier unless the slot already holds a live
    /// entry. Returns false when a live entry was kept.
    async fn repair(&self, from_durable: &CacheEntry) -> bool {
        let now = self.clock.now();
        let repaired = CacheEntry {
            key: from_durable.key.clone(),
            value: from_durable.value.clone(),
            written_at: now,
            ttl_secs: self.repair_ttl.as_secs(),
            tier: Tier::Fast,
            restored: true,
        };
        let stored = self
            .fast
            .set_if(repaired, &move |cur| cur.map_or(true, |c| c.is_expired(now)))
            .await;
        if stored {
            tracing::debug!(target: "cache", key = %from_durable.key, "fast tier repaired from durable");
        } else {
            tracing::debug!(target: "cache", key = %from_durable.key, "live fast-tier entry kept; repair skipped");
        }
        stored
    }

    /// Healing restore: copy the durable entry back into the fast tier. Returns false
    /// when the durable tier has nothing for this key.
    pub async fn restore_from_durable(&self, key: &str) -> bool {
        let resolved = self.resolve(key);
        match self.durable_lookup(&resolved).await {
            Some(e) => {
                self.repair(&e).await;
                true
            }
            None => false,
        }
    }

    /// When the key last received a validated write. Restored copies do not count.
    pub async fn inspect(&self, key: &str) -> Option<Freshness> {
        let resolved = self.resolve(key);
        if let Ok(Some(e)) = tokio::time::timeout(self.read_timeout, self.fast.get(&resolved)).await {
            if !e.restored {
                return Some(Freshness {
                    written_at: e.written_at,
                    ttl: e.ttl(),
                });
            }
        }
        self.durable_lookup(&resolved).await.map(|e| Freshness {
            written_at: e.written_at,
            ttl: e.ttl(),
        })
    }

    pub async fn expire(&self, key: &str) {
        self.fast.expire(&self.resolve(key)).await;
    }

    pub async fn evict_expired(&self) -> usize {
        let n = self.fast.evict_expired(self.clock.now()).await;
        if n > 0 {
            tracing::info!(target: "cache", evicted = n, "expired fast-tier entries evicted");
        }
        n
    }

    pub async fn fast_len(&self) -> usize {
        self.fast.len().await
    }

    pub fn durable_backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    /// Wait until every mirror write queued so far has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.mirror_tx.send(Mirror::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_mirror(
    mut rx: mpsc::UnboundedReceiver<Mirror>,
    durable: Arc<dyn DurableTier>,
    backlog: Arc<AtomicUsize>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Mirror::Upsert(entry) => {
                if let Err(e) = durable.upsert(&entry).await {
                    counter!("cache_durable_errors_total").increment(1);
                    tracing::warn!(target: "cache", key = %entry.key, error = %e, "durable mirror write failed");
                }
                let left = backlog.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
                gauge!("cache_durable_backlog").set(left as f64);
            }
            Mirror::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    tracing::debug!(target: "cache", "durable mirror writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use tokio::sync::Notify;

    fn cfg() -> CacheCfg {
        CacheCfg {
            default_ttl_secs: 60,
            repair_ttl_secs: 30,
            read_timeout_ms: 50,
            durable_path: None,
            ..Default::default()
        }
    }

    fn setup() -> (TieredCache, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 9, 8, 14, 0, 0).unwrap());
        let cache = TieredCache::new(
            Arc::new(MemoryFastTier::new()),
            Arc::new(MemoryDurable::new()),
            &cfg(),
            Arc::new(clock.clone()),
        );
        (cache, clock)
    }

    #[tokio::test]
    async fn fresh_read_is_not_stale() {
        let (c, clock) = setup();
        c.write("VIX", json!(15.2), None).await;
        clock.advance(Duration::from_secs(59));
        let h = c.read("VIX").await;
        let h = h.hit().unwrap();
        assert_eq!(h.value, json!(15.2));
        assert!(!h.stale);
        assert_eq!(h.tier, Tier::Fast);
    }

    #[tokio::test]
    async fn expired_read_falls_back_to_durable_and_repairs() {
        let (c, clock) = setup();
        c.write("VIX", json!(15.2), None).await;
        c.flush().await;
        clock.advance(Duration::from_secs(61));

        let first = c.read("VIX").await;
        let h = first.hit().unwrap();
        assert!(h.stale);
        assert_eq!(h.tier, Tier::Durable);

        // repaired copy is served from the fast tier but still marked stale
        let second = c.read("VIX").await;
        let h = second.hit().unwrap();
        assert!(h.stale);
        assert_eq!(h.tier, Tier::Fast);
    }

    #[tokio::test]
    async fn missing_key_is_unavailable() {
        let (c, _) = setup();
        assert_eq!(c.read("nope").await, CacheRead::Unavailable);
    }

    #[tokio::test]
    async fn alias_reads_underlying_key() {
        let (c, _) = setup();
        c.write("^VIX", json!(16.0), None).await;
        c.alias("VIX", "^VIX").unwrap();
        let r = c.read("VIX").await;
        let h = r.hit().unwrap();
        assert_eq!(h.key, "^VIX");
        assert_eq!(h.alias_of.as_deref(), Some("VIX"));
        assert_eq!(h.value, json!(16.0));
    }

    #[tokio::test]
    async fn alias_cycles_are_rejected() {
        let (c, _) = setup();
        c.alias("a", "b").unwrap();
        c.alias("b", "c").unwrap();
        assert!(matches!(c.alias("c", "a"), Err(CacheError::AliasCycle { .. })));
        assert!(matches!(c.alias("x", "x"), Err(CacheError::AliasCycle { .. })));
    }

    #[tokio::test]
    async fn inspect_ignores_restored_copies() {
        let (c, clock) = setup();
        c.write("A", json!(1), None).await;
        c.flush().await;
        let written = clock.now();
        clock.advance(Duration::from_secs(120));
        assert!(c.restore_from_durable("A").await);
        let f = c.inspect("A").await.unwrap();
        assert_eq!(f.written_at, written);
    }

    #[tokio::test]
    async fn sub_second_ttl_is_not_born_expired() {
        let (c, _) = setup();
        let e = c.write("T", json!(1), Some(Duration::from_millis(500))).await;
        assert_eq!(e.ttl_secs, 1);
        let r = c.read("T").await;
        let h = r.hit().unwrap();
        assert_eq!(h.tier, Tier::Fast);
        assert!(!h.stale);
    }

    /// Reads snapshot the stored entry, then hold until released.
    struct GatedDurable {
        inner: MemoryDurable,
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl DurableTier for GatedDurable {
        async fn upsert(&self, entry: &CacheEntry) -> Result<(), CacheError> {
            self.inner.upsert(entry).await
        }
        async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
            let snapshot = self.inner.get(key).await;
            self.entered.notify_one();
            self.release.notified().await;
            snapshot
        }
    }

    #[tokio::test]
    async fn write_during_durable_read_is_not_overwritten_by_repair() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 9, 8, 14, 0, 0).unwrap());
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let durable = GatedDurable {
            inner: MemoryDurable::new(),
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
        };
        let c = TieredCache::new(
            Arc::new(MemoryFastTier::new()),
            Arc::new(durable),
            &CacheCfg {
                read_timeout_ms: 5_000,
                ..cfg()
            },
            Arc::new(clock.clone()),
        );
        c.write("K", json!("old"), None).await;
        c.flush().await;
        clock.advance(Duration::from_secs(61));

        let (during, ()) = tokio::join!(c.read("K"), async {
            entered.notified().await;
            c.write("K", json!("new"), None).await;
            release.notify_one();
        });
        let h = during.hit().unwrap();
        assert_eq!(h.value, json!("new"));
        assert!(!h.stale);

        let after = c.read("K").await;
        let h = after.hit().unwrap();
        assert_eq!(h.value, json!("new"));
        assert!(!h.stale);
        assert_eq!(h.tier, Tier::Fast);
    }

    struct SlowDurable;

    #[async_trait]
    impl DurableTier for SlowDurable {
        async fn upsert(&self, _entry: &CacheEntry) -> Result<(), CacheError> {
            Ok(())
        }
        async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, CacheError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_durable_read_is_bounded() {
        let clock = ManualClock::new(Utc::now());
        let c = TieredCache::new(
            Arc::new(MemoryFastTier::new()),
            Arc::new(SlowDurable),
            &cfg(),
            Arc::new(clock),
        );
        let started = tokio::time::Instant::now();
        assert_eq!(c.read("X").await, CacheRead::Unavailable);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
