// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod escalation;
pub mod gate;
pub mod heal;
pub mod health;
pub mod ingest;
pub mod issue;
pub mod metrics;
pub mod registry;
pub mod supervisor;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_router, AppState};
pub use crate::cache::{CacheRead, TieredCache};
pub use crate::config::Settings;
pub use crate::escalation::{EscalationEngine, EscalationSink, Incident, SinkMux};
pub use crate::gate::{Decision, Readiness, ReadinessGate, ValidationReport};
pub use crate::health::{HealthMonitor, HealthState};
pub use crate::issue::{AlertPattern, Issue, IssueKind, Target};
pub use crate::supervisor::Supervisor;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Components log under their own targets, so the default filter names each one.
pub const DEFAULT_LOG_FILTER: &str =
    "feed_gate=info,ingest=info,gate=info,cache=info,health=info,heal=info,escalation=info,warn";

/// Install the global tracing subscriber. `LOG_FORMAT=json` switches to JSON lines;
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if let Err(e) = res {
        eprintln!("tracing already initialised: {e}");
    }
}
