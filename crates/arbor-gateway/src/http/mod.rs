pub mod chat;
pub mod conversations;
pub mod health;
pub mod sync;
pub mod tools;

use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;
use tracing::warn;

use arbor_store::StoreError;

/// JSON error payload every non-2xx response carries.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorBody>);

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

/// Store failures map to 404 (unknown or foreign entity) or 500.
pub fn store_error(e: StoreError) -> ApiError {
    if e.is_not_found() {
        api_error(StatusCode::NOT_FOUND, e.to_string())
    } else {
        warn!(error = %e, "store operation failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

/// Session identifier a client tags its requests with, used to skip the
/// originating session when broadcasting.
pub const SESSION_HEADER: &str = "x-session-id";

pub fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
