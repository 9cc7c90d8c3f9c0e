//! Axum route handlers for grids and follow-up actions.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::generation::handlers::AcceptedResponse;
use crate::models::{GridId, GridRecord, JobId, JobKind, UserId};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub user_id: UserId,
    /// `upscale`, `variation` or `reroll`.
    pub action: JobKind,
    /// Candidate index for upscale and variation.
    pub index: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct GridResponse {
    #[serde(flatten)]
    pub grid: GridRecord,
    /// The grid's job followed by its ancestors.
    pub lineage: Vec<JobId>,
}

/// GET /api/v1/grids/:grid_id
pub async fn handle_get_grid(
    State(state): State<AppState>,
    Path(grid_id): Path<Uuid>,
) -> Result<Json<GridResponse>, AppError> {
    let grid = state.orchestrator.grid(GridId(grid_id)).await?;
    let lineage = state.orchestrator.lineage(grid.job_id());
    Ok(Json(GridResponse { grid, lineage }))
}

/// POST /api/v1/grids/:grid_id/actions
///
/// Button press on a rendered grid. Goes through the same quota and queue
/// path as an original submission.
pub async fn handle_grid_action(
    State(state): State<AppState>,
    Path(grid_id): Path<Uuid>,
    payload: Result<Json<ActionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError> {
    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;

    let handle = state
        .orchestrator
        .submit_derived(request.user_id, GridId(grid_id), request.action, request.index)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            job_id: handle.job_id,
            kind: request.action,
            status: handle.status(),
        }),
    ))
}
