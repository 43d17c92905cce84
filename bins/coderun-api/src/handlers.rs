// HTTP route handlers for the coderun API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use coderun_common::types::ExecutionRequest;
use coderun_engine::{Rejection, SubmittedJob};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub session_id: String,
    pub code: String,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub code_running: bool,
    pub job_id: Option<Uuid>,
}

/// Submit through the engine, keeping metrics and completion tracking in one place.
/// Shared by the REST and WebSocket paths.
pub fn submit(state: &AppState, request: ExecutionRequest) -> Result<Uuid, Rejection> {
    metrics::SUBMISSIONS.inc();
    let session_id = request.session_id.clone();

    match state.coordinator.submit(request) {
        Ok(job) => {
            let job_id = job.job_id();
            info!(job_id = %job_id, session_id = %session_id, "Job submitted");
            tokio::spawn(track_completion(job));
            Ok(job_id)
        }
        Err(rejection) => {
            metrics::REJECTIONS.with_label_values(&[rejection.reason()]).inc();
            warn!(session_id = %session_id, reason = rejection.reason(), "Job rejected");
            Err(rejection)
        }
    }
}

async fn track_completion(job: SubmittedJob) {
    match job.wait().await {
        Ok(report) => metrics::record_finished(&report),
        Err(e) => error!(error = %e, "Job task ended without a report"),
    }
}

pub fn rejection_status(rejection: &Rejection) -> StatusCode {
    match rejection {
        Rejection::SessionBusy => StatusCode::CONFLICT,
        Rejection::RequestTooLarge { .. } | Rejection::EmptyRequest => StatusCode::BAD_REQUEST,
    }
}

/// POST /api/execute - Start running code for a session
pub async fn execute_code(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExecuteRequest>,
) -> Response {
    let request = ExecutionRequest::new(payload.session_id, payload.code, payload.timeout);
    match submit(&state, request) {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(ExecuteResponse { job_id })).into_response(),
        Err(rejection) => (
            rejection_status(&rejection),
            Json(serde_json::json!({
                "error": rejection.reason(),
                "message": rejection.to_string(),
            })),
        )
            .into_response(),
    }
}

/// POST /api/stop - Cancel the session's running job
pub async fn stop_code(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<StopRequest>,
) -> Response {
    match state.coordinator.cancel(&payload.session_id) {
        Ok(job_id) => (
            StatusCode::OK,
            Json(serde_json::json!({ "ok": true, "job_id": job_id })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": e.reason(),
                "message": e.to_string(),
            })),
        )
            .into_response(),
    }
}

/// GET /api/status/:session_id - Whether code is running for a session
pub async fn session_status(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<SessionStatus> {
    let job_id = state.coordinator.active_job(&session_id);
    Json(SessionStatus {
        session_id,
        code_running: job_id.is_some(),
        job_id,
    })
}

/// GET /health - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus exposition
pub async fn metrics_handler() -> Response {
    match metrics::render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}
