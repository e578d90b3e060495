use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::FetchError;
use crate::ingest::types::{DataProvider, SourceRequest};

/// Serves fixed values keyed by series. Used for offline/demo mode.
pub struct StaticProvider {
    id: String,
    values: HashMap<String, serde_json::Value>,
}

impl StaticProvider {
    pub fn new(id: impl Into<String>, values: HashMap<String, serde_json::Value>) -> Self {
        Self {
            id: id.into(),
            values,
        }
    }
}

#[async_trait]
impl DataProvider for StaticProvider {
    async fn fetch(&self, req: &SourceRequest) -> Result<serde_json::Value, FetchError> {
        self.values
            .get(&req.series)
            .cloned()
            .ok_or_else(|| FetchError::Permanent(format!("unknown series '{}'", req.series)))
    }

    fn id(&self) -> &str {
        &self.id
    }
}
