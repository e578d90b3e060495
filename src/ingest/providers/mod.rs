pub mod fixture;
pub mod http;

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ProviderKind, Settings};
use crate::ingest::types::DataProvider;

pub use fixture::StaticProvider;
pub use http::HttpJsonProvider;

pub type ProviderSet = HashMap<String, Arc<dyn DataProvider>>;

/// Instantiate every configured provider.
pub fn build_providers(settings: &Settings) -> Result<ProviderSet> {
    let timeout = settings.orchestrator.request_timeout();
    let mut out: ProviderSet = HashMap::with_capacity(settings.providers.len());
    for cfg in &settings.providers {
        let p: Arc<dyn DataProvider> = match cfg.kind {
            ProviderKind::Http => Arc::new(HttpJsonProvider::from_cfg(cfg, timeout)?),
            ProviderKind::Static => Arc::new(StaticProvider::new(cfg.id.clone(), cfg.values.clone())),
        };
        out.insert(cfg.id.clone(), p);
    }
    Ok(out)
}
