//! Request authentication — the collaborator contract only.
//!
//! The middleware resolves a username and stores it in request extensions;
//! handlers read it back with `Extension<CurrentUser>`. Who actually minted
//! the credential (login flow, cookie store, fronting proxy) is outside the
//! core.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use arbor_core::config::AuthMode;

use crate::app::AppState;
use crate::http::ErrorBody;

/// Username of the authenticated requester, placed in request extensions.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub String);

/// Header a fronting proxy uses to assert the username.
pub const TRUSTED_PROXY_HEADER: &str = "x-auth-user";

/// Middleware: resolve the request user or answer 401.
pub async fn require_user(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(user) = resolve_user(&state, req.headers()) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "unauthorized".to_string(),
            }),
        )
            .into_response();
    };

    // First sight of a user creates the row the ownership checks join on.
    if let Err(e) = state.store.ensure_user(&user) {
        tracing::warn!(error = %e, "ensure_user failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: "internal error".to_string(),
            }),
        )
            .into_response();
    }

    req.extensions_mut().insert(CurrentUser(user));
    next.run(req).await
}

fn resolve_user(state: &AppState, headers: &HeaderMap) -> Option<String> {
    let auth = &state.config.gateway.auth;
    match auth.mode {
        AuthMode::None => Some(auth.user.clone()),
        AuthMode::Token => {
            let expected = auth.token.as_deref()?;
            let presented = extract_bearer(headers)?;
            (presented == expected).then(|| auth.user.clone())
        }
        AuthMode::TrustedProxy => headers
            .get(TRUSTED_PROXY_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string),
    }
}

pub(crate) fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
