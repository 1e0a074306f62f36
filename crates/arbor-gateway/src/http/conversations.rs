//! Conversation CRUD endpoints.
//!
//! Every mutation broadcasts to the user's other sessions; the originating
//! session (from the `X-Session-ID` header) is skipped.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use serde::Deserialize;
use uuid::Uuid;

use arbor_store::types::{Conversation, Message};

use crate::app::AppState;
use crate::auth::CurrentUser;
use crate::http::{api_error, session_id, store_error, ApiError};
use crate::sync::SyncEvent;

/// GET /api/conversations — the user's conversations, newest first.
pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    state
        .store
        .get_all_conversations(&user)
        .map(Json)
        .map_err(store_error)
}

#[derive(Deserialize)]
pub struct AddBody {
    pub conversation: Conversation,
}

/// POST /api/conversations/add — create a conversation explicitly.
/// The owner is always the authenticated user; an empty id gets a fresh
/// UUID.
pub async fn add_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    headers: HeaderMap,
    Json(body): Json<AddBody>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let mut conv = body.conversation;
    conv.user = user.clone();
    if conv.id.is_empty() {
        conv.id = Uuid::new_v4().to_string();
    }

    let created = state.store.add_conversation(&conv).map_err(store_error)?;

    let source = session_id(&headers).unwrap_or_default();
    state.bus.broadcast(
        &user,
        &source,
        SyncEvent::ConversationCreated {
            conversation_id: created.id.clone(),
            conversation: created.clone(),
        },
    );

    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/conversations/{id}
pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, ApiError> {
    state
        .store
        .get_conversation(&user, &id)
        .map(Json)
        .map_err(store_error)
}

/// DELETE /api/conversations/{id} — cascade-deletes messages,
/// attachments, and tool calls.
pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .delete_conversation(&user, &id)
        .map_err(store_error)?;

    let source = session_id(&headers).unwrap_or_default();
    state.bus.broadcast(
        &user,
        &source,
        SyncEvent::ConversationDeleted {
            conversation_id: id,
        },
    );

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct RenameBody {
    pub title: String,
}

/// POST /api/conversations/{id}/rename
pub async fn rename_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> Result<Json<Conversation>, ApiError> {
    if body.title.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "title cannot be empty"));
    }

    let renamed = state
        .store
        .rename_conversation(&user, &id, body.title.trim())
        .map_err(store_error)?;

    let source = session_id(&headers).unwrap_or_default();
    state.bus.broadcast(
        &user,
        &source,
        SyncEvent::ConversationUpdated {
            conversation_id: renamed.id.clone(),
            conversation: renamed.clone(),
        },
    );

    Ok(Json(renamed))
}

/// GET /api/conversations/{id}/messages — the whole tree as an id-keyed
/// mapping, children derived.
pub async fn messages_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<Json<HashMap<i64, Message>>, ApiError> {
    state
        .store
        .get_all_conversation_messages(&user, &id)
        .map(Json)
        .map_err(store_error)
}
