//! Axum route handlers for the Generation API.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::models::{
    AspectRatio, JobId, JobKind, JobStatus, Quality, ReferenceImage, Style, UserId,
};
use crate::profile::ParamOverrides;
use crate::state::AppState;

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

/// Omitted fields take the user's saved settings; omitted `references` take
/// the saved library. An explicit empty list sends no references.
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub user_id: UserId,
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub style: Option<Style>,
    #[serde(default)]
    pub quality: Option<Quality>,
    #[serde(default)]
    pub aspect_ratio: Option<AspectRatio>,
    #[serde(default)]
    pub references: Option<Vec<ReferenceImage>>,
}

impl GenerateRequest {
    fn into_parts(self) -> (UserId, String, ParamOverrides) {
        let overrides = ParamOverrides {
            model: self.model,
            style: self.style,
            quality: self.quality,
            aspect_ratio: self.aspect_ratio,
            references: self.references,
        };
        (self.user_id, self.prompt, overrides)
    }
}

/// Returned for every accepted submission, original or follow-up.
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/generations
///
/// Reserves quota and queues an original generation. Quota, queue and
/// validation denials come back immediately; the grid arrives through the
/// presentation layer once the job finishes.
pub async fn handle_generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError> {
    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let (user_id, prompt, overrides) = request.into_parts();
    let params = state
        .profiles
        .resolve_params(user_id, prompt, overrides)
        .await?;

    let handle = state.orchestrator.submit_original(user_id, params).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            job_id: handle.job_id,
            kind: JobKind::Original,
            status: handle.status(),
        }),
    ))
}
