//! Axum route handlers for job status and engine introspection.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{JobId, JobStatus};
use crate::orchestrator::EngineStatus;
use crate::queue::JobView;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    /// `false` when the job had already left the queue.
    pub expired: bool,
    pub status: JobStatus,
}

/// GET /api/v1/jobs/:job_id
pub async fn handle_get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>, AppError> {
    state
        .orchestrator
        .job(JobId(job_id))
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))
}

/// DELETE /api/v1/jobs/:job_id
///
/// The platform's interaction window closed before the job ran.
pub async fn handle_cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, AppError> {
    let job_id = JobId(job_id);
    let expired = state.orchestrator.expire(job_id);
    let view = state
        .orchestrator
        .job(job_id)
        .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))?;

    Ok(Json(CancelResponse {
        job_id,
        expired,
        status: view.status,
    }))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub engine: EngineStatus,
    pub model: String,
}

/// GET /api/v1/status
pub async fn handle_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        engine: state.orchestrator.status(),
        model: state.config.gemini_model.clone(),
    })
}
