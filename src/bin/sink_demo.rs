//! Pushes a few sample incidents through the escalation sinks configured in the
//! environment (log only when no channel credentials are set).

use chrono::Utc;
use feed_gate::config::ActionKind;
use feed_gate::escalation::{AttemptOutcome, HealingAttempt, IncidentContext};
use feed_gate::{AlertPattern, EscalationSink, Incident, IssueKind, SinkMux, Target};

fn sample(kind: IssueKind, target: Target, escalated: bool, attempts: u32) -> Incident {
    let now = Utc::now();
    let healing_attempts = (1..=attempts)
        .map(|n| HealingAttempt {
            attempt: n,
            strategy: "refetch-and-repair".into(),
            action: ActionKind::Refetch,
            outcome: AttemptOutcome::Unresolved,
            started_at: now,
            finished_at: now,
            detail: Some("demo attempt".into()),
        })
        .collect();
    Incident::open(
        AlertPattern {
            kind,
            target: target.clone(),
        },
        IncidentContext {
            target,
            detail: "demo incident".into(),
            recent_results: Vec::new(),
        },
        healing_attempts,
        escalated,
        now,
    )
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    feed_gate::init_tracing();
    let mux = SinkMux::from_env();

    let incidents = [
        sample(IssueKind::StaleCache, Target::CacheKey("DGS10".into()), true, 3),
        sample(IssueKind::RateLimited, Target::Provider("fred".into()), false, 0),
        sample(IssueKind::Unknown, Target::Dependent("dashboard".into()), true, 0),
    ];

    for inc in &incidents {
        if let Err(e) = mux.notify(inc).await {
            eprintln!("delivery failed: {e:#}");
        }
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    }

    println!("sink-demo done");
}
