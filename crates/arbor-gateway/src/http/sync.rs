//! Long-poll sync endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};

use arbor_core::config::SYNC_POLL_TIMEOUT_SECS;

use crate::app::AppState;
use crate::auth::CurrentUser;
use crate::http::{api_error, session_id};
use crate::sync::SubscriberGuard;

/// GET /api/conversations/sync — wait up to 45 seconds for a conversation
/// event aimed at this user from another session. 200 with the event JSON,
/// 204 on timeout or when the subscriber is replaced by a reconnect.
///
/// The subscription is removed when this request returns or is dropped.
pub async fn poll_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    headers: HeaderMap,
) -> Response {
    let Some(session) = session_id(&headers) else {
        return api_error(StatusCode::BAD_REQUEST, "X-Session-ID header is required")
            .into_response();
    };

    let mut sub = state.bus.subscribe(&user, &session);
    let _guard = SubscriberGuard {
        bus: &state.bus,
        user: user.clone(),
        session,
    };

    tokio::select! {
        event = sub.rx.recv() => match event {
            Some(ev) => Json(ev).into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        },
        _ = tokio::time::sleep(Duration::from_secs(SYNC_POLL_TIMEOUT_SECS)) => {
            StatusCode::NO_CONTENT.into_response()
        }
        _ = sub.closed.cancelled() => StatusCode::NO_CONTENT.into_response(),
    }
}
