use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};

use super::sink::{headline, EscalationSink};
use super::Incident;

pub struct EmailSink {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl EmailSink {
    /// `Ok(None)` when SMTP is not configured at all; an error when it is configured
    /// but unusable.
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(host) = std::env::var("SMTP_HOST") else {
            return Ok(None);
        };
        let user = std::env::var("SMTP_USER").context("SMTP_USER missing")?;
        let pass = std::env::var("SMTP_PASS").context("SMTP_PASS missing")?;
        let from_addr = std::env::var("NOTIFY_EMAIL_FROM").context("NOTIFY_EMAIL_FROM missing")?;
        let to_addr = std::env::var("NOTIFY_EMAIL_TO").context("NOTIFY_EMAIL_TO missing")?;

        let creds = Credentials::new(user, pass);
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
            .context("invalid SMTP_HOST")?
            .credentials(creds)
            .build();

        let from = from_addr.parse().context("invalid NOTIFY_EMAIL_FROM")?;
        let to = to_addr.parse().context("invalid NOTIFY_EMAIL_TO")?;

        Ok(Some(Self { mailer, from, to }))
    }
}

fn body(incident: &Incident) -> String {
    let mut out = format!(
        "Incident: {}\nPattern: {}\nEscalated: {}\nDetail: {}\nOpened: {}\n",
        incident.id,
        incident.trigger_pattern,
        incident.escalated,
        incident.context.detail,
        incident.opened_at.to_rfc3339()
    );
    for a in &incident.healing_attempts {
        out.push_str(&format!(
            "  attempt {} via {}: {} ({})\n",
            a.attempt,
            a.strategy,
            a.outcome,
            a.finished_at.to_rfc3339()
        ));
    }
    for r in &incident.context.recent_results {
        out.push_str(&format!(
            "  fetch {} #{} via {}: {:?} {}\n",
            r.source_id,
            r.attempt,
            r.provider_used.as_deref().unwrap_or("-"),
            r.outcome,
            r.error.as_deref().unwrap_or("")
        ));
    }
    out
}

#[async_trait]
impl EscalationSink for EmailSink {
    fn name(&self) -> &str {
        "email"
    }

    async fn notify(&self, incident: &Incident) -> Result<()> {
        let msg = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(format!("feed-gate {}", headline(incident)))
            .header(header::ContentType::TEXT_PLAIN)
            .body(body(incident))
            .context("build email")?;

        self.mailer.send(msg).await.context("send email")?;
        Ok(())
    }
}
