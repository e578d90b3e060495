// src/escalation/sink.rs
//! Outbound incident channels. Delivery is at-least-once: a sink may see the same open
//! incident more than once and must tolerate it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use super::discord::DiscordSink;
use super::email::EmailSink;
use super::slack::SlackSink;
use super::Incident;

#[async_trait]
pub trait EscalationSink: Send + Sync {
    fn name(&self) -> &str;
    async fn notify(&self, incident: &Incident) -> Result<()>;
}

/// One-line summary shared by the chat sinks.
pub(crate) fn headline(incident: &Incident) -> String {
    let state = if incident.escalated {
        "ESCALATED"
    } else {
        "open"
    };
    format!(
        "[{state}] {} ({} healing attempt(s))",
        incident.trigger_pattern,
        incident.healing_attempts.len()
    )
}

/// Writes incidents to the log. Always available.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl EscalationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, incident: &Incident) -> Result<()> {
        tracing::warn!(
            target: "escalation",
            incident = %incident.id,
            pattern = %incident.trigger_pattern,
            escalated = incident.escalated,
            attempts = incident.healing_attempts.len(),
            detail = %incident.context.detail,
            "incident"
        );
        Ok(())
    }
}

/// Keeps every delivered incident in memory. Used by tests and the demo binary.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    delivered: Arc<Mutex<Vec<Incident>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<Incident> {
        self.delivered.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.delivered.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.delivered.lock().is_empty()
    }
}

#[async_trait]
impl EscalationSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn notify(&self, incident: &Incident) -> Result<()> {
        self.delivered.lock().push(incident.clone());
        Ok(())
    }
}

/// POSTs the serialized incident to a generic webhook (queue bridge, automation hook).
#[derive(Clone)]
pub struct WebhookSink {
    url: String,
    client: Client,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: Client::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn from_env() -> Option<Self> {
        std::env::var("ESCALATION_WEBHOOK_URL").ok().filter(|u| !u.is_empty()).map(Self::new)
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }
}

#[async_trait]
impl EscalationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, incident: &Incident) -> Result<()> {
        self.client
            .post(&self.url)
            .timeout(self.timeout)
            .json(incident)
            .send()
            .await
            .context("escalation webhook post")?
            .error_for_status()
            .context("escalation webhook non-2xx")?;
        Ok(())
    }
}

/// Fans an incident out to every configured sink. A failing sink is logged and
/// counted; it never stops delivery to the others.
#[derive(Clone, Default)]
pub struct SinkMux {
    sinks: Vec<Arc<dyn EscalationSink>>,
}

impl SinkMux {
    pub fn new(sinks: Vec<Arc<dyn EscalationSink>>) -> Self {
        Self { sinks }
    }

    /// Log sink plus every channel whose credentials are present in the environment.
    pub fn from_env() -> Self {
        let mut sinks: Vec<Arc<dyn EscalationSink>> = vec![Arc::new(LogSink)];
        if let Some(s) = WebhookSink::from_env() {
            sinks.push(Arc::new(s));
        }
        if let Some(s) = SlackSink::from_env() {
            sinks.push(Arc::new(s));
        }
        if let Some(s) = DiscordSink::from_env() {
            sinks.push(Arc::new(s));
        }
        match EmailSink::from_env() {
            Ok(Some(s)) => sinks.push(Arc::new(s)),
            Ok(None) => {}
            Err(e) => tracing::warn!(target: "escalation", "email sink disabled: {e:#}"),
        }
        tracing::info!(
            target: "escalation",
            sinks = ?sinks.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
            "escalation sinks configured"
        );
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EscalationSink>) {
        self.sinks.push(sink);
    }

    pub fn names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }
}

#[async_trait]
impl EscalationSink for SinkMux {
    fn name(&self) -> &str {
        "mux"
    }

    /// Errors only when every sink failed.
    async fn notify(&self, incident: &Incident) -> Result<()> {
        let results = futures::future::join_all(self.sinks.iter().map(|s| s.notify(incident))).await;
        let mut failed = 0usize;
        for (sink, res) in self.sinks.iter().zip(results) {
            if let Err(e) = res {
                failed += 1;
                counter!("escalation_sink_errors_total", "sink" => sink.name().to_string()).increment(1);
                tracing::warn!(target: "escalation", sink = sink.name(), incident = %incident.id, "sink delivery failed: {e:#}");
            }
        }
        if !self.sinks.is_empty() && failed == self.sinks.len() {
            anyhow::bail!("all {failed} escalation sinks failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::{Incident, IncidentContext};
    use crate::issue::{AlertPattern, IssueKind, Target};
    use chrono::Utc;

    struct Broken;

    #[async_trait]
    impl EscalationSink for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        async fn notify(&self, _incident: &Incident) -> Result<()> {
            anyhow::bail!("down")
        }
    }

    fn incident() -> Incident {
        let target = Target::Dependent("dashboard".into());
        Incident::open(
            AlertPattern {
                kind: IssueKind::DependentUnresponsive,
                target: target.clone(),
            },
            IncidentContext {
                target,
                detail: "liveness probe failed".into(),
                recent_results: Vec::new(),
            },
            Vec::new(),
            true,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn one_broken_sink_does_not_block_others() {
        let mem = MemorySink::new();
        let mux = SinkMux::new(vec![Arc::new(Broken), Arc::new(mem.clone())]);
        mux.notify(&incident()).await.unwrap();
        assert_eq!(mem.len(), 1);
    }

    #[tokio::test]
    async fn all_broken_is_an_error() {
        let mux = SinkMux::new(vec![Arc::new(Broken)]);
        assert!(mux.notify(&incident()).await.is_err());
    }

    #[test]
    fn headline_marks_escalation() {
        let h = headline(&incident());
        assert!(h.starts_with("[ESCALATED] dependent-unresponsive@dependent:dashboard"));
    }
}
