use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::cache::{CacheRead, TieredCache};
use crate::escalation::{CounterView, EscalationEngine, Incident};
use crate::gate::{ReadinessGate, ValidationReport};
use crate::health::{HealthMonitor, TargetHealth};

/// Closed incidents listed by `/incidents`.
const CLOSED_LISTED: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub readiness: Arc<ReadinessGate>,
    pub cache: Arc<TieredCache>,
    pub monitor: Arc<HealthMonitor>,
    pub escalation: Arc<EscalationEngine>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/ready", get(ready))
        .route("/data/{key}", get(data))
        .route("/report", get(report))
        .route("/targets", get(targets))
        .route("/incidents", get(incidents))
        .route("/incidents/{id}/resolve", post(resolve_incident))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn ready(State(state): State<AppState>) -> Response {
    let r = state.readiness.current();
    let code = if r.is_pass() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(r)).into_response()
}

/// Serves a cached value only while the gate is open. Anything else is an explicit
/// `unavailable`, never a default.
async fn data(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    if !state.readiness.is_ready() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "reason": "validation gate closed" })),
        )
            .into_response();
    }
    match state.cache.read(&key).await {
        CacheRead::Hit(hit) => (StatusCode::OK, Json(CacheRead::Hit(hit))).into_response(),
        CacheRead::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, Json(CacheRead::Unavailable)).into_response(),
    }
}

async fn report(State(state): State<AppState>) -> Json<Option<ValidationReport>> {
    Json(state.readiness.last_report().map(|r| (*r).clone()))
}

async fn targets(State(state): State<AppState>) -> Json<Vec<TargetHealth>> {
    Json(state.monitor.snapshot())
}

#[derive(serde::Serialize)]
struct IncidentsOut {
    open: Vec<Incident>,
    closed: Vec<Incident>,
    counters: Vec<CounterView>,
}

async fn incidents(State(state): State<AppState>) -> Json<IncidentsOut> {
    Json(IncidentsOut {
        open: state.escalation.open_incidents(),
        closed: state.escalation.closed_incidents(CLOSED_LISTED),
        counters: state.escalation.counters(),
    })
}

/// Operator resolution: closes the incident and lets automatic healing start over
/// for its target.
async fn resolve_incident(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.escalation.operator_resolve(id) {
        Some(inc) => {
            state.monitor.operator_reset(&inc.trigger_pattern.target);
            tracing::info!(target: "escalation", incident = %inc.id, "incident resolved by operator");
            (StatusCode::OK, Json(inc)).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no open incident with that id" })),
        )
            .into_response(),
    }
}
