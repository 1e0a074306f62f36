use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Extension, Json};
use serde::Deserialize;
use tracing::debug;

use crate::app::AppState;
use crate::auth::CurrentUser;
use crate::http::{api_error, ApiError};

#[derive(Deserialize)]
pub struct ApproveBody {
    pub id: String,
    pub approved: bool,
}

/// POST /api/tools/approve — deliver the human decision for a pending
/// tool call. Unknown, resolved, or foreign ids answer 404.
pub async fn approve_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(body): Json<ApproveBody>,
) -> Result<StatusCode, ApiError> {
    debug!(id = %body.id, approved = body.approved, "tool approval received");
    if state.approvals.resolve(&user, &body.id, body.approved) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(
            StatusCode::NOT_FOUND,
            "no pending tool call with that id",
        ))
    }
}
