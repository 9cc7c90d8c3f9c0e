use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::models::{ReferenceImage, ReferenceSlot, SettingsUpdate, UserId, UserSettings};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SaveReferenceRequest {
    #[serde(flatten)]
    pub image: ReferenceImage,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReferenceListResponse {
    pub user_id: UserId,
    pub references: Vec<ReferenceSlot>,
}

#[derive(Debug, Serialize)]
pub struct ClearedResponse {
    pub cleared: u64,
}

/// GET /api/v1/users/:user_id/settings
pub async fn handle_get_settings(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
) -> Result<Json<UserSettings>, AppError> {
    Ok(Json(state.profiles.settings(UserId(user_id)).await?))
}

/// PUT /api/v1/users/:user_id/settings
///
/// Partial update: fields left out keep their stored value.
pub async fn handle_update_settings(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
    payload: Result<Json<SettingsUpdate>, JsonRejection>,
) -> Result<Json<UserSettings>, AppError> {
    let Json(update) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let settings = state
        .profiles
        .update_settings(UserId(user_id), update)
        .await?;
    Ok(Json(settings))
}

/// GET /api/v1/users/:user_id/references
pub async fn handle_list_references(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
) -> Result<Json<ReferenceListResponse>, AppError> {
    let user_id = UserId(user_id);
    let references = state.profiles.references(user_id).await?;
    Ok(Json(ReferenceListResponse {
        user_id,
        references,
    }))
}

/// DELETE /api/v1/users/:user_id/references
pub async fn handle_clear_references(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
) -> Result<Json<ClearedResponse>, AppError> {
    let cleared = state.profiles.clear_references(UserId(user_id)).await?;
    Ok(Json(ClearedResponse { cleared }))
}

/// PUT /api/v1/users/:user_id/references/:slot
pub async fn handle_save_reference(
    State(state): State<AppState>,
    Path((user_id, slot)): Path<(u64, u8)>,
    payload: Result<Json<SaveReferenceRequest>, JsonRejection>,
) -> Result<Json<ReferenceSlot>, AppError> {
    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let reference = state
        .profiles
        .save_reference(UserId(user_id), slot, request.image, request.filename)
        .await?;
    Ok(Json(reference))
}

/// DELETE /api/v1/users/:user_id/references/:slot
pub async fn handle_delete_reference(
    State(state): State<AppState>,
    Path((user_id, slot)): Path<(u64, u8)>,
) -> Result<StatusCode, AppError> {
    if state
        .profiles
        .delete_reference(UserId(user_id), slot)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("reference slot {slot} is empty")))
    }
}
