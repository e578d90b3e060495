// src/ingest/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchOutcome {
    Success,
    Failure,
    Timeout,
}

/// One fetch attempt (or the settled result of a source within a pass).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub source_id: String,
    pub pass_id: u64,
    pub attempt: u32,
    pub outcome: FetchOutcome,
    /// Opaque payload; only present on success.
    pub value: Option<serde_json::Value>,
    pub fetched_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub provider_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        self.outcome == FetchOutcome::Success
    }

    /// Placeholder for a source that had not settled when the pass deadline hit.
    pub fn unsettled(source_id: &str, pass_id: u64, at: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.to_string(),
            pass_id,
            attempt: 0,
            outcome: FetchOutcome::Failure,
            value: None,
            fetched_at: at,
            latency_ms: 0,
            provider_used: None,
            error: Some("pass timeout elapsed before source settled".to_string()),
        }
    }
}

/// What a provider needs to know to fetch one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRequest {
    pub source_id: String,
    pub series: String,
}

#[async_trait::async_trait]
pub trait DataProvider: Send + Sync {
    async fn fetch(&self, req: &SourceRequest) -> Result<serde_json::Value, FetchError>;
    fn id(&self) -> &str;
}
