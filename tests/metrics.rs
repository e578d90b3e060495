// tests/metrics.rs
//
// One test per binary: the Prometheus recorder is process-global.

mod common;

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use common::{harness, healthy_provider, settings};
use feed_gate::metrics::Metrics;

#[tokio::test]
async fn metrics_endpoint_exposes_pipeline_series() {
    let metrics = Metrics::init().expect("recorder installs once");
    let h = harness(settings(""), healthy_provider()).await;
    h.provider.fail_times("AUX", 1);
    h.sup.pipeline.run_once().await.unwrap();
    h.sup.monitor.tick().await;
    h.sup.cache.read("CORE").await;

    let app = feed_gate::create_router(h.sup.app_state()).merge(metrics.router());
    let resp = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    for needle in [
        "gate_decisions_total",
        "gate_pass_rate",
        "ingest_fetch_attempts_total",
        "ingest_fetch_failures_total",
        "cache_reads_total",
        "health_target_state",
    ] {
        assert!(text.contains(needle), "missing {needle} in:\n{text}");
    }
}
