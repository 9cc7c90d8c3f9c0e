use std::time::Duration;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::models::UserId;
use crate::quota::{day::format_countdown, QuotaUsage};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub user_id: UserId,
    #[serde(flatten)]
    pub usage: QuotaUsage,
    /// Human-readable time to the next reset, e.g. "5h 12m".
    pub resets_in: String,
}

/// GET /api/v1/users/:user_id/usage
pub async fn handle_usage(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
) -> Json<UsageResponse> {
    let user_id = UserId(user_id);
    let usage = state.orchestrator.usage(user_id).await;
    let resets_in = format_countdown(Duration::from_secs(usage.resets_in_secs));
    Json(UsageResponse {
        user_id,
        usage,
        resets_in,
    })
}
