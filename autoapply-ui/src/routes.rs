//! HTTP route handlers for the console API.

use autoapply::core::types::Job;
use autoapply::io::intervention::{InterventionError, PendingIntervention};
use autoapply::io::monitor::MonitorSnapshot;
use autoapply::io::store::{StatusCounts, StoreError};
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinError;
use tracing::{info, warn};

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/jobs", get(list_jobs).post(enqueue_job))
        .route("/jobs/{id}/abort", post(abort_job))
        .route("/intervention", get(get_intervention).post(resolve_intervention))
}

/// Error body: `{"error": "..."}` with a matching status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status == StatusCode::SERVICE_UNAVAILABLE {
            warn!(error = %err, "job store unavailable");
        }
        Self::new(status, err.to_string())
    }
}

impl From<JoinError> for ApiError {
    fn from(err: JoinError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct StatusResponse {
    monitor: MonitorSnapshot,
    counts: StatusCounts,
    intervention: Option<PendingIntervention>,
}

/// GET /api/status - worker phases, recent log lines, job counts and the pending question.
async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let counts = state.with_store(|store| store.counts()).await??;
    Ok(Json(StatusResponse {
        monitor: state.monitor.snapshot(),
        counts,
        intervention: state.gate.pending(),
    }))
}

/// GET /api/jobs - every job, most recently updated first.
async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<Job>>, ApiError> {
    let jobs = state.with_store(|store| store.list_all()).await??;
    Ok(Json(jobs))
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    company: String,
}

/// POST /api/jobs - 201 when queued, 409 when the URL is already known.
async fn enqueue_job(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if request.url.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "url must not be empty"));
    }
    let added = state
        .with_store(move |store| store.enqueue(&request.url, &request.title, &request.company))
        .await??;
    let status = if added {
        StatusCode::CREATED
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(json!({ "added": added }))))
}

#[derive(Debug, Deserialize)]
struct AbortRequest {
    #[serde(default = "default_abort_reason")]
    reason: String,
}

fn default_abort_reason() -> String {
    "aborted from console".to_string()
}

/// POST /api/jobs/{id}/abort - 409 when the job is already terminal.
async fn abort_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<AbortRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let aborted = state
        .with_store(move |store| store.abort(id, &request.reason))
        .await??;
    if aborted {
        info!(job_id = id, "job aborted from console");
        Ok((StatusCode::OK, Json(json!({ "aborted": true }))))
    } else {
        Ok((StatusCode::CONFLICT, Json(json!({ "aborted": false }))))
    }
}

/// GET /api/intervention - the pending question, or `null`.
async fn get_intervention(State(state): State<AppState>) -> Json<Option<PendingIntervention>> {
    Json(state.gate.pending())
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    value: String,
}

/// POST /api/intervention - supply the value for the pending question.
async fn resolve_intervention(
    State(state): State<AppState>,
    Json(request): Json<ResolveRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .gate
        .resolve(request.value)
        .map_err(|err: InterventionError| ApiError::new(StatusCode::CONFLICT, err.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}
