//! TGE batch orchestrator binary entrypoint.
//! Loads configuration, wires sources and the batch service, and serves the
//! HTTP API plus `/metrics`.

use anyhow::Context;
use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tge_batch_orchestrator::{app_from_config, config::load_pipeline_config};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // The runtime may already have installed a subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .try_init();
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = load_pipeline_config().context("loading pipeline config")?;
    let (router, service) = app_from_config(&cfg).context("building batch service")?;
    service.spawn_maintenance();

    tracing::info!(
        sources = service.orchestrator().registry().len(),
        "tge batch orchestrator ready"
    );
    Ok(router.into())
}
