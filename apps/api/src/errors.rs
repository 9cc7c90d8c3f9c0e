use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Externally visible failure kinds.
///
/// Everything that crosses the orchestrator boundary (submission denials and
/// terminal job failures alike) is expressed as one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("daily generation limit reached")]
    DailyLimitExceeded,

    #[error("rate limit exceeded, try again shortly")]
    RateLimitExceeded,

    #[error("generation queue is full, try again shortly")]
    QueueFull,

    #[error("prompt blocked by safety filter, try different wording")]
    SafetyBlocked,

    #[error("image provider error")]
    UpstreamError,

    #[error("image provider timed out")]
    Timeout,

    #[error("request expired before it could run, start again from a fresh grid")]
    Expired,

    #[error("grid not found")]
    NotFound,

    #[error("candidate index out of range")]
    InvalidIndex,

    #[error("grid belongs to another user")]
    NotOwner,

    #[error("invalid generation request")]
    InvalidRequest,
}

impl ErrorKind {
    /// Stable machine-readable code used in HTTP bodies and presenter events.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::DailyLimitExceeded => "DAILY_LIMIT_EXCEEDED",
            ErrorKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorKind::QueueFull => "QUEUE_FULL",
            ErrorKind::SafetyBlocked => "SAFETY_BLOCKED",
            ErrorKind::UpstreamError => "UPSTREAM_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Expired => "EXPIRED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::InvalidIndex => "INVALID_INDEX",
            ErrorKind::NotOwner => "NOT_OWNER",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
        }
    }

    /// Whether resubmitting the same request later can succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimitExceeded
                | ErrorKind::QueueFull
                | ErrorKind::UpstreamError
                | ErrorKind::Timeout
        )
    }

    /// User-fixable failures get the full message; the rest are shown as a
    /// generic failure by the presentation layer.
    pub fn is_user_facing(self) -> bool {
        matches!(
            self,
            ErrorKind::DailyLimitExceeded
                | ErrorKind::RateLimitExceeded
                | ErrorKind::QueueFull
                | ErrorKind::SafetyBlocked
                | ErrorKind::Expired
                | ErrorKind::NotOwner
                | ErrorKind::InvalidRequest
        )
    }

    fn status(self) -> StatusCode {
        match self {
            ErrorKind::DailyLimitExceeded
            | ErrorKind::RateLimitExceeded
            | ErrorKind::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidIndex | ErrorKind::InvalidRequest | ErrorKind::SafetyBlocked => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorKind::NotOwner => StatusCode::FORBIDDEN,
            ErrorKind::Expired => StatusCode::GONE,
            ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Denied(#[from] ErrorKind),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Denied(kind) => (kind.status(), kind.code(), kind.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_and_backpressure_map_to_429() {
        for kind in [
            ErrorKind::DailyLimitExceeded,
            ErrorKind::RateLimitExceeded,
            ErrorKind::QueueFull,
        ] {
            let response = AppError::Denied(kind).into_response();
            assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        }
    }

    #[test]
    fn test_stale_and_unknown_grid_statuses() {
        assert_eq!(
            AppError::Denied(ErrorKind::Expired).into_response().status(),
            StatusCode::GONE
        );
        assert_eq!(
            AppError::Denied(ErrorKind::NotFound).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Denied(ErrorKind::InvalidIndex)
                .into_response()
                .status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_safety_block_is_not_retryable() {
        assert!(!ErrorKind::SafetyBlocked.is_retryable());
        assert!(ErrorKind::SafetyBlocked.is_user_facing());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::UpstreamError.is_user_facing());
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DailyLimitExceeded).unwrap();
        assert_eq!(json, "\"daily_limit_exceeded\"");
    }
}
