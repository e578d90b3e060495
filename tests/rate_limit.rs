// tests/rate_limit.rs
//
// Provider rate limiting: persisted delay growth, throttle status, the global
// concurrency ceiling, and the backoff-increase healing path driven by the throttle probe.

mod common;

use std::time::Duration;

use serde_json::json;

use feed_gate::error::FetchError;
use feed_gate::gate::Decision;
use feed_gate::health::HealthState;
use feed_gate::Target;

use common::{harness, healthy_provider, settings, PROVIDER};

fn rate_limited() -> Result<serde_json::Value, FetchError> {
    Err(FetchError::RateLimited { retry_after: None })
}

fn delay(h: &common::Harness) -> u64 {
    h.sup
        .registry
        .limits()
        .get(PROVIDER)
        .map(|l| l.extra_delay_ms)
        .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn repeated_rate_limits_grow_the_delay_monotonically() {
    let h = harness(settings(""), healthy_provider()).await;
    for _ in 0..3 {
        h.provider.push("AUX", rate_limited());
    }

    let mut seen = vec![delay(&h)];

    // Both retries of the first pass are rate limited.
    let first = h.sup.pipeline.run_once().await.unwrap();
    assert_eq!(first.decision, Decision::Pass, "AUX is standard; 1/2 meets 0.5");
    assert!(first.failed_sources.contains("AUX"));
    seen.push(delay(&h));
    assert!(h.sup.pipeline.orchestrator().throttle().get(PROVIDER).exhausted_at.is_some());

    // Third rate limit, then the retry succeeds.
    let second = h.sup.pipeline.run_once().await.unwrap();
    assert!(second.failed_sources.is_empty());
    seen.push(delay(&h));
    assert!(h.sup.pipeline.orchestrator().throttle().get(PROVIDER).exhausted_at.is_none());

    assert_eq!(seen, vec![0, 200, 400]);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(start_paused = true)]
async fn delay_stops_at_the_configured_cap() {
    let mut s = settings("");
    s.orchestrator.max_extra_delay_ms = 300;
    let h = harness(s, healthy_provider()).await;
    let limits = h.sup.registry.limits();

    assert_eq!(limits.increase_delay(PROVIDER).await, Some(100));
    assert_eq!(limits.increase_delay(PROVIDER).await, Some(200));
    assert_eq!(limits.increase_delay(PROVIDER).await, Some(300));
    assert_eq!(limits.increase_delay(PROVIDER).await, None);
    assert_eq!(delay(&h), 300);
}

#[tokio::test(start_paused = true)]
async fn throttle_probe_triggers_backoff_healing_then_recovers() {
    let h = harness(settings(""), healthy_provider()).await;
    h.provider.push("AUX", rate_limited());
    h.provider.push("AUX", rate_limited());
    h.sup.pipeline.run_once().await.unwrap();
    assert_eq!(delay(&h), 200);

    let target = Target::Provider(PROVIDER.into());
    h.sup.monitor.tick().await;
    assert_eq!(h.sup.monitor.state_of(&target), Some(HealthState::Healing));
    assert_eq!(delay(&h), 400, "healing raised the delay once more");

    // The action acknowledged the throttle, so the next probe sees a healthy provider.
    h.sup.monitor.tick().await;
    assert_eq!(h.sup.monitor.state_of(&target), Some(HealthState::Healthy));
    assert!(h.sup.escalation.open_incidents().is_empty());
    assert!(h.sink.is_empty());
}

const FOUR_MORE: &str = r#"
[[sources]]
id = "S1"
category = "fx"
primary = "scripted"

[[sources]]
id = "S2"
category = "fx"
primary = "scripted"

[[sources]]
id = "S3"
category = "credit"
primary = "scripted"

[[sources]]
id = "S4"
category = "credit"
primary = "scripted"
"#;

#[tokio::test(start_paused = true)]
async fn in_flight_fetches_stay_under_the_concurrency_cap() {
    let mut s = settings(FOUR_MORE);
    s.orchestrator.max_concurrency = 2;
    let provider = healthy_provider()
        .ok("S1", json!(1.08))
        .ok("S2", json!(0.91))
        .ok("S3", json!(3.1))
        .ok("S4", json!(2.7));
    let h = harness(s, provider).await;
    for id in ["CORE", "AUX", "S1", "S2", "S3", "S4"] {
        h.provider.set_delay(id, Duration::from_millis(200));
    }

    let report = h.sup.pipeline.run_once().await.unwrap();
    assert_eq!(report.successes, 6);
    assert_eq!(h.provider.peak_in_flight(), 2);
}
