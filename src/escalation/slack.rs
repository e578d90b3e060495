use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::sink::{headline, EscalationSink};
use super::Incident;

pub struct SlackSink {
    webhook_url: String,
    client: Client,
    timeout: Duration,
}

impl SlackSink {
    pub fn from_env() -> Option<Self> {
        std::env::var("SLACK_WEBHOOK_URL")
            .ok()
            .filter(|u| !u.is_empty())
            .map(Self::new)
    }

    pub fn new(url: String) -> Self {
        Self {
            webhook_url: url,
            client: Client::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }
}

fn message(incident: &Incident) -> String {
    format!(
        "*feed-gate incident* {}\n{}\nopened {} · id `{}`",
        headline(incident),
        incident.context.detail,
        incident.opened_at.to_rfc3339(),
        incident.id
    )
}

#[async_trait]
impl EscalationSink for SlackSink {
    fn name(&self) -> &str {
        "slack"
    }

    async fn notify(&self, incident: &Incident) -> Result<()> {
        let body = serde_json::json!({ "text": message(incident) });
        self.client
            .post(&self.webhook_url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .context("slack post")?
            .error_for_status()
            .context("slack non-2xx")?;
        Ok(())
    }
}
