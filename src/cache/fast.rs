// src/cache/fast.rs
//! Fast tier: short-TTL key/value store with expiry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use super::CacheEntry;

/// Decides whether the entry currently held for a key may be replaced.
pub type SlotCheck = dyn Fn(Option<&CacheEntry>) -> bool + Send + Sync;

/// What the cache needs from an ephemeral store. Implementations may drop expired
/// entries on their own; the cache re-checks expiry on every hit anyway.
#[async_trait]
pub trait FastTier: Send + Sync {
    async fn get(&self, key: &str) -> Option<CacheEntry>;
    async fn set(&self, entry: CacheEntry);
    /// Store `entry` only when `replace` accepts the slot currently held for its key.
    /// The check and the store happen atomically; returns whether the entry was stored.
    async fn set_if(&self, entry: CacheEntry, replace: &SlotCheck) -> bool;
    async fn expire(&self, key: &str);
    /// Drop every entry expired at `now`; returns how many went.
    async fn evict_expired(&self, now: DateTime<Utc>) -> usize;
    async fn len(&self) -> usize;
}

#[derive(Debug, Default)]
pub struct MemoryFastTier {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryFastTier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FastTier for MemoryFastTier {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    async fn set(&self, entry: CacheEntry) {
        self.entries.write().insert(entry.key.clone(), entry);
    }

    async fn set_if(&self, entry: CacheEntry, replace: &SlotCheck) -> bool {
        let mut g = self.entries.write();
        if !replace(g.get(&entry.key)) {
            return false;
        }
        g.insert(entry.key.clone(), entry);
        true
    }

    async fn expire(&self, key: &str) {
        self.entries.write().remove(key);
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut g = self.entries.write();
        let before = g.len();
        g.retain(|_, e| !e.is_expired(now));
        before - g.len()
    }

    async fn len(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Tier;
    use chrono::Duration as ChronoDuration;

    fn entry(key: &str, at: DateTime<Utc>, ttl_secs: u64) -> CacheEntry {
        CacheEntry {
            key: key.into(),
            value: serde_json::json!(1),
            written_at: at,
            ttl_secs,
            tier: Tier::Fast,
            restored: false,
        }
    }

    #[tokio::test]
    async fn evicts_only_expired() {
        let t = MemoryFastTier::new();
        let now = Utc::now();
        t.set(entry("old", now - ChronoDuration::seconds(120), 60)).await;
        t.set(entry("new", now, 60)).await;
        assert_eq!(t.evict_expired(now).await, 1);
        assert!(t.get("old").await.is_none());
        assert!(t.get("new").await.is_some());
        assert_eq!(t.len().await, 1);
    }

    #[tokio::test]
    async fn set_if_keeps_the_slot_when_rejected() {
        let t = MemoryFastTier::new();
        let now = Utc::now();
        t.set(entry("k", now, 60)).await;

        let older = entry("k", now - ChronoDuration::seconds(30), 60);
        assert!(!t.set_if(older, &|cur| cur.is_none()).await);
        assert_eq!(t.get("k").await.map(|e| e.written_at), Some(now));

        assert!(t.set_if(entry("other", now, 60), &|cur| cur.is_none()).await);
        assert_eq!(t.len().await, 2);
    }
}
