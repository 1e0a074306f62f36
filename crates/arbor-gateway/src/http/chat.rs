//! Chat endpoints — streaming turns, retry branches, message edits, and
//! resuming an in-progress stream after a reconnect.

use std::convert::Infallible;
use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{sse::Sse, IntoResponse, Response},
    Extension, Json,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use arbor_agent::provider::ModelTag;
use arbor_store::types::{setting_keys, Message, UpdateMessage};

use crate::app::AppState;
use crate::auth::CurrentUser;
use crate::http::{api_error, session_id, store_error, ApiError};
use crate::sse;
use crate::sync::SyncEvent;
use crate::turn::{self, TurnEvent, TurnRequest};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamBody {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub parent_id: i64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub web_search: bool,
    #[serde(default)]
    pub attached_file_ids: Vec<String>,
}

/// POST /api/chat/stream — run a full turn, answering with the SSE frame
/// sequence (`metadata`, chunks, tool events, `complete`). Validation
/// failures answer 400 before any frame is written.
pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    headers: HeaderMap,
    Json(body): Json<StreamBody>,
) -> Result<Response, ApiError> {
    if body.content.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "content cannot be empty"));
    }
    let model = resolve_model_tag(&state, &user, body.model.as_deref())?;

    let req = TurnRequest {
        conversation_id: body.conversation_id,
        parent_id: body.parent_id,
        model,
        content: Some(body.content),
        web_search: body.web_search,
        attached_file_ids: body.attached_file_ids,
    };

    Ok(spawn_turn(state, user, session_id(&headers).unwrap_or_default(), req))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryBody {
    pub conversation_id: String,
    pub parent_id: i64,
    #[serde(default)]
    pub model: Option<String>,
}

/// POST /api/chat/retry/stream — regenerate from an existing user message,
/// creating a sibling branch. No new user message is written.
pub async fn retry_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    headers: HeaderMap,
    Json(body): Json<RetryBody>,
) -> Result<Response, ApiError> {
    if body.conversation_id.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "conversationId cannot be empty",
        ));
    }
    if body.parent_id <= 0 {
        return Err(api_error(StatusCode::BAD_REQUEST, "parentId is required"));
    }
    let model = resolve_model_tag(&state, &user, body.model.as_deref())?;

    let req = TurnRequest {
        conversation_id: Some(body.conversation_id),
        parent_id: body.parent_id,
        model,
        content: None,
        web_search: false,
        attached_file_ids: Vec::new(),
    };

    Ok(spawn_turn(state, user, session_id(&headers).unwrap_or_default(), req))
}

/// Launch the orchestrator and adapt its events into the SSE response.
fn spawn_turn(state: Arc<AppState>, user: String, session: String, req: TurnRequest) -> Response {
    let (tx, rx) = mpsc::channel::<TurnEvent>(64);
    tokio::spawn(turn::run_turn(state, user, session, req, tx));

    let stream = ReceiverStream::new(rx).map(|ev| Ok::<_, Infallible>(sse::frame(&ev)));
    (sse::stream_headers(), Sse::new(stream)).into_response()
}

/// The model tag for a turn: explicit request value, then the user's
/// `defaultModel` setting, then the configured fallback.
fn resolve_model_tag(
    state: &AppState,
    user: &str,
    requested: Option<&str>,
) -> Result<ModelTag, ApiError> {
    let tag = match requested {
        Some(tag) if !tag.is_empty() => tag.to_string(),
        _ => state
            .store
            .get_setting(user, setting_keys::DEFAULT_MODEL)
            .ok()
            .flatten()
            .or_else(|| state.config.defaults.model.clone())
            .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "model is required"))?,
    };
    ModelTag::parse(&tag).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBody {
    pub conversation_id: String,
    pub message_id: i64,
    pub content: String,
}

#[derive(Serialize)]
pub struct UpdateResponse {
    pub messages: HashMap<i64, Message>,
}

/// POST /api/chat/update — edit a message's text. Structure (parent,
/// children, role) and assistant stats are preserved.
pub async fn update_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    headers: HeaderMap,
    Json(body): Json<UpdateBody>,
) -> Result<Json<UpdateResponse>, ApiError> {
    let conv = state
        .store
        .get_conversation(&user, &body.conversation_id)
        .map_err(store_error)?;

    let current = state
        .store
        .get_message(&user, body.message_id)
        .map_err(store_error)?;
    if current.conv_id != conv.id {
        return Err(api_error(StatusCode::NOT_FOUND, "message not found"));
    }

    let updated = state
        .store
        .update_message(
            &user,
            body.message_id,
            &UpdateMessage {
                content: Some(body.content),
                ..Default::default()
            },
        )
        .map_err(store_error)?;

    let _ = state.store.touch_conversation(&user, &conv.id);
    if let Ok(snapshot) = state.store.get_conversation(&user, &conv.id) {
        let source = session_id(&headers).unwrap_or_default();
        state.bus.broadcast(
            &user,
            &source,
            SyncEvent::ConversationUpdated {
                conversation_id: conv.id.clone(),
                conversation: snapshot,
            },
        );
    }

    let mut messages = HashMap::new();
    messages.insert(updated.id, updated);
    Ok(Json(UpdateResponse { messages }))
}

/// GET /api/chat/resume — replay the user's in-progress turn and follow it
/// live until it completes. 204 when nothing is streaming.
pub async fn resume_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Response {
    let Some(active) = state.turns.resume(&user) else {
        return StatusCode::NO_CONTENT.into_response();
    };

    let (buffered, mut live) = active.replay();
    let stream = async_stream::stream! {
        let mut finished = false;
        for ev in buffered {
            finished |= is_terminal(&ev);
            yield Ok::<_, Infallible>(sse::frame(&ev));
        }
        while !finished {
            match live.recv().await {
                Ok(ev) => {
                    finished = is_terminal(&ev);
                    yield Ok(sse::frame(&ev));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    (sse::stream_headers(), Sse::new(stream)).into_response()
}

fn is_terminal(ev: &TurnEvent) -> bool {
    matches!(ev, TurnEvent::Complete { .. } | TurnEvent::Error { .. })
}
