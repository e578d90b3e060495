//! feed-gate binary entrypoint.
//! Loads configuration, assembles the supervisor, starts the ingestion and health
//! loops and serves the HTTP surface plus `/metrics`.

use anyhow::{Context, Result};
use std::sync::Arc;

use feed_gate::config::{self, DEFAULT_BIND, ENV_BIND};
use feed_gate::metrics::Metrics;
use feed_gate::{clock, create_router, SinkMux, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when the file is absent.
    let _ = dotenvy::dotenv();
    feed_gate::init_tracing();

    let settings = config::load_default().context("loading configuration")?;
    let sink = SinkMux::from_env();

    let supervisor = Supervisor::build(settings, Arc::new(sink), clock::system()).await?;
    let handles = supervisor.start();

    let metrics = Metrics::init()?;
    let router = create_router(supervisor.app_state()).merge(metrics.router());

    let bind = std::env::var(ENV_BIND).unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(%bind, "serving");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await;

    handles.abort();
    supervisor.cache.flush().await;
    served.context("http server")
}
