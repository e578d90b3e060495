// src/cache/durable.rs
//! Durable tier: upsert / query-by-key store that outlives the process.
//!
//! [`JsonLedger`] appends one JSON line per upsert and keeps an in-memory index of the
//! latest entry per key. The index is rebuilt from the file on open; later lines
//! supersede earlier ones.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::CacheEntry;
use crate::error::CacheError;

#[async_trait]
pub trait DurableTier: Send + Sync {
    async fn upsert(&self, entry: &CacheEntry) -> Result<(), CacheError>;
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;
}

#[derive(Debug)]
pub struct JsonLedger {
    path: PathBuf,
    index: RwLock<HashMap<String, CacheEntry>>,
    append: tokio::sync::Mutex<()>,
}

impl JsonLedger {
    /// Open (or create) the ledger at `path`. Unparseable lines are skipped with a warning.
    /// The file is compacted when it holds many superseded lines.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .await
                    .map_err(|e| CacheError::Durable(format!("create {}: {e}", dir.display())))?;
            }
        }

        let mut index = HashMap::new();
        let mut lines = 0usize;
        match fs::read_to_string(&path).await {
            Ok(body) => {
                for (n, line) in body.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    lines += 1;
                    match serde_json::from_str::<CacheEntry>(line) {
                        Ok(e) => {
                            index.insert(e.key.clone(), e);
                        }
                        Err(e) => {
                            tracing::warn!(target: "cache", line = n + 1, error = %e, "skipping bad ledger line")
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::Durable(format!("read {}: {e}", path.display()))),
        }

        tracing::info!(target: "cache", path = %path.display(), keys = index.len(), lines, "durable ledger opened");
        let ledger = Self {
            path,
            index: RwLock::new(index),
            append: tokio::sync::Mutex::new(()),
        };
        if lines > 2 * ledger.index.read().len() + 64 {
            ledger.compact().await?;
        }
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Rewrite the file with one line per key (tmp + rename).
    pub async fn compact(&self) -> Result<(), CacheError> {
        let _g = self.append.lock().await;
        let mut body = String::new();
        {
            let idx = self.index.read();
            let mut keys: Vec<&String> = idx.keys().collect();
            keys.sort();
            for k in keys {
                let line = serde_json::to_string(&idx[k]).map_err(|e| CacheError::Durable(e.to_string()))?;
                body.push_str(&line);
                body.push('\n');
            }
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp, body)
            .await
            .map_err(|e| CacheError::Durable(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CacheError::Durable(format!("replace {}: {e}", self.path.display())))?;
        tracing::debug!(target: "cache", path = %self.path.display(), "durable ledger compacted");
        Ok(())
    }
}

#[async_trait]
impl DurableTier for JsonLedger {
    async fn upsert(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let mut line = serde_json::to_string(entry).map_err(|e| CacheError::Durable(e.to_string()))?;
        line.push('\n');

        let _g = self.append.lock().await;
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| CacheError::Durable(format!("open {}: {e}", self.path.display())))?;
        f.write_all(line.as_bytes())
            .await
            .map_err(|e| CacheError::Durable(format!("append {}: {e}", self.path.display())))?;
        f.flush()
            .await
            .map_err(|e| CacheError::Durable(format!("flush {}: {e}", self.path.display())))?;

        self.index.write().insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.index.read().get(key).cloned())
    }
}

/// Process-local durable tier for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryDurable {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryDurable {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableTier for MemoryDurable {
    async fn upsert(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        self.entries.write().insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.read().get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Tier;
    use chrono::Utc;

    fn entry(key: &str, v: f64) -> CacheEntry {
        CacheEntry {
            key: key.into(),
            value: serde_json::json!(v),
            written_at: Utc::now(),
            ttl_secs: 60,
            tier: Tier::Durable,
            restored: false,
        }
    }

    #[tokio::test]
    async fn reopen_keeps_latest_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("durable.jsonl");

        let l = JsonLedger::open(&path).await.unwrap();
        l.upsert(&entry("VIX", 14.0)).await.unwrap();
        l.upsert(&entry("VIX", 15.5)).await.unwrap();
        l.upsert(&entry("DGS10", 4.2)).await.unwrap();
        drop(l);

        let l = JsonLedger::open(&path).await.unwrap();
        assert_eq!(l.len(), 2);
        let vix = l.get("VIX").await.unwrap().unwrap();
        assert_eq!(vix.value, serde_json::json!(15.5));
    }

    #[tokio::test]
    async fn bad_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("durable.jsonl");
        let good = serde_json::to_string(&entry("A", 1.0)).unwrap();
        std::fs::write(&path, format!("{good}\nnot json\n")).unwrap();

        let l = JsonLedger::open(&path).await.unwrap();
        assert_eq!(l.len(), 1);
        assert!(l.get("A").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn compaction_leaves_one_line_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("durable.jsonl");
        let l = JsonLedger::open(&path).await.unwrap();
        for i in 0..5 {
            l.upsert(&entry("A", i as f64)).await.unwrap();
        }
        l.compact().await.unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body.lines().count(), 1);
        assert_eq!(l.get("A").await.unwrap().unwrap().value, serde_json::json!(4.0));
    }
}
