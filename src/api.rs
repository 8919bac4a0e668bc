use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::error::BatchError;
use crate::orchestrator::FetchRequest;
use crate::service::BatchService;

const DEFAULT_LIST_LIMIT: usize = 50;

pub type AppState = Arc<BatchService>;

pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/batches", post(submit_batch).get(list_batches))
        .route("/batches/{id}", get(get_batch))
        .route("/batches/{id}/cancel", post(cancel_batch))
        .route("/sources/health", get(source_health))
        .layer(CorsLayer::very_permissive())
        .with_state(service)
}

/// Maps boundary errors to HTTP status codes.
struct ApiError(BatchError);

impl From<BatchError> for ApiError {
    fn from(e: BatchError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            BatchError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct SubmitParams {
    #[serde(default)]
    wait: bool,
}

async fn submit_batch(
    State(service): State<AppState>,
    Query(params): Query<SubmitParams>,
    Json(req): Json<FetchRequest>,
) -> Result<Response, ApiError> {
    if params.wait {
        let record = service.run_batch(req).await?;
        return Ok((StatusCode::OK, Json(record)).into_response());
    }
    let id = service.submit_batch(req)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id }))).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_batches(
    State(service): State<AppState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    Json(service.list_batches(params.limit.unwrap_or(DEFAULT_LIST_LIMIT)))
}

async fn get_batch(
    State(service): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(service.get_batch(id)?))
}

async fn cancel_batch(
    State(service): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cancelled = service.cancel_batch(id)?;
    Ok(Json(json!({ "id": id, "cancelled": cancelled })))
}

async fn source_health(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.source_health())
}
