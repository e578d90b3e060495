// src/error.rs
//! Typed errors for the ingestion core. Binary and loader boundaries wrap these in `anyhow`.

use std::time::Duration;

/// Provider error taxonomy. The orchestrator branches on the variant to pick
/// retry, backoff or fallback.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FetchError {
    /// 429-equivalent. `retry_after` comes from the provider when it sends one.
    #[error("rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// 5xx, connection reset, malformed body that might succeed on retry.
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider request timed out")]
    Timeout,
    /// 4xx other than 429, unknown series. Retrying the same provider is pointless.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GateError {
    /// A pass with zero sources cannot be scored.
    #[error("ingestion pass contained no sources; check the source registry configuration")]
    EmptyPass,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {path} not found")]
    NotFound { path: String },
    #[error("reading config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(String),
    #[error("source registry is empty")]
    EmptyRegistry,
    #[error("duplicate source id '{0}'")]
    DuplicateSource(String),
    #[error("source '{source_id}' references undeclared provider '{provider}'")]
    UnknownProvider { source_id: String, provider: String },
    #[error("success threshold {0} outside [0, 1]")]
    BadThreshold(f64),
    #[error("healing strategy '{0}' must allow at least one attempt")]
    ZeroAttempts(String),
    #[error("alert threshold for '{0}' must be at least 1")]
    ZeroAlertThreshold(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("alias '{from}' -> '{to}' would create a cycle")]
    AliasCycle { from: String, to: String },
    #[error("durable tier: {0}")]
    Durable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_detected() {
        let e = FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(e.is_rate_limited());
        assert!(!FetchError::Timeout.is_rate_limited());
    }

    #[test]
    fn config_error_messages_name_the_offender() {
        let e = ConfigError::UnknownProvider {
            source_id: "VIX".into(),
            provider: "cboe".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("VIX") && msg.contains("cboe"));
    }
}
