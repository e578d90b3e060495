use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use std::time::Duration;

use crate::config::ProviderCfg;
use crate::error::FetchError;
use crate::ingest::types::{DataProvider, SourceRequest};

/// Generic JSON-over-HTTP provider. One GET per source per attempt.
pub struct HttpJsonProvider {
    id: String,
    url_template: String,
    api_key: Option<String>,
    value_pointer: Option<String>,
    client: Client,
}

impl HttpJsonProvider {
    pub fn new(id: impl Into<String>, url_template: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("building http client: {e}"))?;
        Ok(Self {
            id: id.into(),
            url_template: url_template.into(),
            api_key: None,
            value_pointer: None,
            client,
        })
    }

    pub fn from_cfg(cfg: &ProviderCfg, timeout: Duration) -> anyhow::Result<Self> {
        let template = cfg
            .url_template
            .clone()
            .ok_or_else(|| anyhow::anyhow!("provider '{}' has no url_template", cfg.id))?;
        let api_key = match &cfg.api_key_env {
            Some(var) => Some(
                std::env::var(var)
                    .map_err(|_| anyhow::anyhow!("Missing {var} env var for provider '{}'", cfg.id))?,
            ),
            None => None,
        };
        let mut p = Self::new(cfg.id.clone(), template, timeout)?;
        p.api_key = api_key;
        p.value_pointer = cfg.value_pointer.clone();
        Ok(p)
    }

    pub fn with_value_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.value_pointer = Some(pointer.into());
        self
    }

    fn url_for(&self, req: &SourceRequest) -> String {
        self.url_template
            .replace("{series}", &req.series)
            .replace("{api_key}", self.api_key.as_deref().unwrap_or_default())
    }
}

fn classify_transport(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transient(e.to_string())
    }
}

pub(crate) fn classify_status(status: StatusCode, retry_after: Option<&str>) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = retry_after
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Some(FetchError::RateLimited { retry_after });
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return Some(FetchError::Transient(format!("status {status}")));
    }
    Some(FetchError::Permanent(format!("status {status}")))
}

#[async_trait]
impl DataProvider for HttpJsonProvider {
    async fn fetch(&self, req: &SourceRequest) -> Result<serde_json::Value, FetchError> {
        let resp = self
            .client
            .get(self.url_for(req))
            .send()
            .await
            .map_err(classify_transport)?;

        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(err) = classify_status(resp.status(), retry_after.as_deref()) {
            tracing::debug!(target: "ingest", provider = %self.id, source = %req.source_id, error = %err, "provider http error");
            return Err(err);
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Transient(format!("decode body: {e}")))?;

        match &self.value_pointer {
            Some(ptr) => body
                .pointer(ptr)
                .cloned()
                .ok_or_else(|| FetchError::Permanent(format!("no value at {ptr}"))),
            None => Ok(body),
        }
    }

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::OK, None), None);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some("7")),
            Some(FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            })
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None),
            Some(FetchError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None),
            Some(FetchError::Permanent(_))
        ));
    }

    #[test]
    fn url_template_substitutes_series_and_key() {
        let mut p = HttpJsonProvider::new(
            "fred",
            "https://api.example.test/{series}?api_key={api_key}",
            Duration::from_secs(1),
        )
        .unwrap();
        p.api_key = Some("k".into());
        let url = p.url_for(&SourceRequest {
            source_id: "DGS10".into(),
            series: "DGS10".into(),
        });
        assert_eq!(url, "https://api.example.test/DGS10?api_key=k");
    }
}
