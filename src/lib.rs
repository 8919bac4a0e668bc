// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod aggregate;
pub mod api;
pub mod config;
pub mod dedup;
pub mod enrich;
pub mod error;
pub mod health;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod retry;
pub mod service;
pub mod sources;

use std::sync::Arc;

use axum::Router;

pub use crate::api::router;
pub use crate::config::PipelineConfig;
pub use crate::service::BatchService;

/// Wire the service from `cfg` and return the full router (API + `/metrics`)
/// together with the service handle.
pub fn app_from_config(cfg: &PipelineConfig) -> anyhow::Result<(Router, Arc<BatchService>)> {
    let registry = cfg.build_registry()?;
    let service = Arc::new(BatchService::from_config(cfg, registry)?);
    let metrics = metrics::Metrics::init(cfg)?;
    let router = api::router(service.clone()).merge(metrics.router());
    Ok((router, service))
}
