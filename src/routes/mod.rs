pub mod admin;
pub mod health;
pub mod playback;

use axum::{http::StatusCode, Json};
use serde_json::Value;

use crate::error::AppError;

/// Error body returned by every handler
pub type ApiError = (StatusCode, Json<Value>);

pub fn error_response(status: StatusCode, message: &str) -> ApiError {
    (status, Json(serde_json::json!({ "error": message })))
}

/// Map an orchestration error to a response. Provider and storage details
/// are logged, never echoed.
pub fn app_error(err: AppError) -> ApiError {
    match err {
        AppError::Transport(ref msg) => {
            tracing::warn!("Upstream unavailable: {}", msg);
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "temporarily unable to resolve",
            )
        }
        AppError::NotFound(msg) => error_response(StatusCode::NOT_FOUND, &msg),
        AppError::InvalidInput(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
        other => {
            tracing::error!("Request failed: {}", other);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}
