//! Turn orchestrator — the state machine of a single user turn.
//!
//! Flow: persist user message → build context → stream assistant →
//! execute tool calls (approval-gated) → re-stream with tool results →
//! persist final assistant message → broadcast → complete.
//!
//! The orchestrator drives an `mpsc::Sender<TurnEvent>`; the HTTP handler
//! adapts events into SSE frames. A failed send means the client went
//! away: accumulated content is flushed to the placeholder row with an
//! error status before resources are released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use arbor_agent::approval::{ApprovalOutcome, PendingToolCall, DENIED_OUTPUT, TIMEOUT_OUTPUT};
use arbor_agent::context::build_context;
use arbor_agent::provider::{
    ChatClient, ChatMessage, ChatRequest, ModelTag, ReasoningEffort, WireToolCall,
};
use arbor_agent::stream::{StreamEvent, ToolCallLedger};
use arbor_agent::tools::to_definitions;
use arbor_core::config::MAX_TOOL_ROUNDS;
use arbor_store::types::{
    setting_keys, Conversation, Message, MessageStatus, Role, ToolCallRecord, ToolEntry,
    UpdateMessage, BUILTIN_SERVER_ID,
};

use crate::app::AppState;
use crate::sync::SyncEvent;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
/// Buffer for live followers of an in-progress turn (`/chat/resume`).
const REPLAY_CHANNEL_CAPACITY: usize = 256;

/// Events of one streamed turn, in emission order. `Metadata` precedes all
/// chunks; `Complete` is the final success event.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    Metadata {
        conversation_id: String,
        user_message_id: i64,
    },
    Chunk {
        content: Option<String>,
        reasoning: Option<String>,
        tool_call: Option<String>,
    },
    ToolAwaiting {
        id: String,
        name: String,
        args: String,
    },
    ToolResult {
        id: String,
        output: String,
    },
    Complete {
        user_message_id: i64,
        assistant_message_id: i64,
    },
    Error {
        error: String,
    },
}

/// A turn currently streaming for some user. Buffers every frame so a
/// reconnecting session can replay and then follow live.
pub struct ActiveTurn {
    pub conversation_id: String,
    frames: Mutex<Vec<TurnEvent>>,
    live: broadcast::Sender<TurnEvent>,
}

impl ActiveTurn {
    fn record(&self, ev: &TurnEvent) {
        // Snapshot and subscription both run under this lock, so replay
        // never misses a frame recorded in between.
        let mut frames = self.frames.lock().unwrap();
        frames.push(ev.clone());
        let _ = self.live.send(ev.clone());
    }

    /// Buffered frames so far plus a receiver for the rest.
    pub fn replay(&self) -> (Vec<TurnEvent>, broadcast::Receiver<TurnEvent>) {
        let frames = self.frames.lock().unwrap();
        (frames.clone(), self.live.subscribe())
    }
}

/// Registry of in-progress turns, one per user.
#[derive(Default)]
pub struct TurnTracker {
    active: DashMap<String, Arc<ActiveTurn>>,
}

impl TurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self, user: &str, conversation_id: &str) -> Arc<ActiveTurn> {
        let (live, _) = broadcast::channel(REPLAY_CHANNEL_CAPACITY);
        let turn = Arc::new(ActiveTurn {
            conversation_id: conversation_id.to_string(),
            frames: Mutex::new(Vec::new()),
            live,
        });
        self.active.insert(user.to_string(), Arc::clone(&turn));
        turn
    }

    fn finish(&self, user: &str) {
        self.active.remove(user);
    }

    /// The user's in-progress turn, if any.
    pub fn resume(&self, user: &str) -> Option<Arc<ActiveTurn>> {
        self.active.get(user).map(|t| Arc::clone(&t))
    }
}

/// Validated input for one turn. `content == None` marks a retry: no new
/// user message is written and the assistant branches off `parent_id`.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: Option<String>,
    pub parent_id: i64,
    pub model: ModelTag,
    pub content: Option<String>,
    pub web_search: bool,
    pub attached_file_ids: Vec<String>,
}

struct Cancelled;

enum TurnError {
    /// Client went away; flush and go quiet.
    Cancelled,
    /// Something broke; flush and try to tell the client.
    Failed(String),
}

/// Event emission with replay recording. A send failure means the request
/// was dropped client-side.
struct TurnStream {
    tx: mpsc::Sender<TurnEvent>,
    turn: Arc<ActiveTurn>,
}

impl TurnStream {
    async fn emit(&self, ev: TurnEvent) -> Result<(), Cancelled> {
        self.turn.record(&ev);
        self.tx.send(ev).await.map_err(|_| Cancelled)
    }
}

/// What the loop has accumulated so far; flushed into the placeholder row
/// on success, error, and cancellation alike.
#[derive(Default)]
struct Accum {
    content: String,
    reasoning: String,
    prompt_tokens: u32,
    completion_tokens: u32,
    speed: f64,
}

/// Run one user turn to completion. Never panics the request; all failure
/// edges end in an `error` event and a best-effort placeholder flush.
pub async fn run_turn(
    state: Arc<AppState>,
    user: String,
    session_id: String,
    req: TurnRequest,
    tx: mpsc::Sender<TurnEvent>,
) {
    let retry = req.content.is_none();

    // ── Conversation resolution ─────────────────────────────────────────────
    let (conv, created) = match resolve_conversation(&state, &user, &req, retry) {
        Ok(pair) => pair,
        Err(message) => {
            let _ = tx.send(TurnEvent::Error { error: message }).await;
            return;
        }
    };
    if created {
        state.bus.broadcast(
            &user,
            &session_id,
            SyncEvent::ConversationCreated {
                conversation_id: conv.id.clone(),
                conversation: conv.clone(),
            },
        );
    }

    // ── User message ────────────────────────────────────────────────────────
    let user_message_id = if retry {
        match state.store.get_message(&user, req.parent_id) {
            Ok(m) if m.conv_id == conv.id => m.id,
            Ok(_) => {
                let _ = tx
                    .send(TurnEvent::Error {
                        error: "message does not belong to this conversation".to_string(),
                    })
                    .await;
                return;
            }
            Err(e) => {
                let _ = tx.send(TurnEvent::Error { error: e.to_string() }).await;
                return;
            }
        }
    } else {
        // A non-root parent must exist in this conversation before the
        // child is written.
        if req.parent_id != 0 {
            match state.store.get_message(&user, req.parent_id) {
                Ok(m) if m.conv_id == conv.id => {}
                _ => {
                    let _ = tx
                        .send(TurnEvent::Error {
                            error: "parent message not found".to_string(),
                        })
                        .await;
                    return;
                }
            }
        }
        let mut msg = Message::new(&conv.id, Role::User, req.content.clone().unwrap_or_default());
        msg.parent_id = req.parent_id;
        match state.store.save_message(&msg) {
            Ok(id) => id,
            Err(e) => {
                let _ = tx.send(TurnEvent::Error { error: e.to_string() }).await;
                return;
            }
        }
    };

    for file_id in &req.attached_file_ids {
        // Upload happens out of band; keep the reference valid either way.
        if let Err(e) = state.store.ensure_file(file_id, "") {
            warn!(error = %e, file_id, "ensure_file failed");
            continue;
        }
        if let Err(e) = state.store.add_attachment(user_message_id, file_id) {
            warn!(error = %e, file_id, "attachment insert failed");
        }
    }

    // ── Placeholder assistant message ───────────────────────────────────────
    let mut placeholder = Message::new(&conv.id, Role::Assistant, "");
    placeholder.parent_id = user_message_id;
    placeholder.status = MessageStatus::Streaming;
    placeholder.model = Some(req.model.to_string());
    let assistant_id = match state.store.save_message(&placeholder) {
        Ok(id) => id,
        Err(e) => {
            let _ = tx.send(TurnEvent::Error { error: e.to_string() }).await;
            return;
        }
    };

    let stream = TurnStream {
        tx,
        turn: state.turns.begin(&user, &conv.id),
    };

    let mut accum = Accum::default();
    let result = drive_turn(
        &state,
        &user,
        &req,
        &conv,
        user_message_id,
        assistant_id,
        &stream,
        &mut accum,
    )
    .await;

    match result {
        Ok(()) => {
            finalize_placeholder(&state, &user, assistant_id, &accum, MessageStatus::Completed, None);
            let _ = state.store.touch_conversation(&user, &conv.id);
            if let Ok(snapshot) = state.store.get_conversation(&user, &conv.id) {
                state.bus.broadcast(
                    &user,
                    &session_id,
                    SyncEvent::ConversationUpdated {
                        conversation_id: conv.id.clone(),
                        conversation: snapshot,
                    },
                );
            }
            if created && !retry {
                spawn_title_generation(
                    Arc::clone(&state),
                    user.clone(),
                    conv.id.clone(),
                    req.clone(),
                );
            }
            let _ = stream
                .emit(TurnEvent::Complete {
                    user_message_id,
                    assistant_message_id: assistant_id,
                })
                .await;
            info!(conv = %conv.id, user_message_id, assistant_id, "turn complete");
        }
        Err(TurnError::Cancelled) => {
            debug!(conv = %conv.id, assistant_id, "turn cancelled by client");
            finalize_placeholder(
                &state,
                &user,
                assistant_id,
                &accum,
                MessageStatus::Error,
                Some("cancelled by client".to_string()),
            );
        }
        Err(TurnError::Failed(message)) => {
            warn!(conv = %conv.id, assistant_id, error = %message, "turn failed");
            finalize_placeholder(
                &state,
                &user,
                assistant_id,
                &accum,
                MessageStatus::Error,
                Some(message.clone()),
            );
            let _ = stream.emit(TurnEvent::Error { error: message }).await;
        }
    }

    state.turns.finish(&user);
}

fn resolve_conversation(
    state: &AppState,
    user: &str,
    req: &TurnRequest,
    retry: bool,
) -> Result<(Conversation, bool), String> {
    let create = |id: String| -> Result<(Conversation, bool), String> {
        let title = derive_title(req.content.as_deref().unwrap_or(""));
        state
            .store
            .add_conversation(&Conversation {
                id,
                user: user.to_string(),
                title,
                created_at: String::new(),
                updated_at: String::new(),
            })
            .map(|c| (c, true))
            .map_err(|e| e.to_string())
    };

    match req.conversation_id.as_deref() {
        Some(id) if !id.is_empty() => match state.store.get_conversation(user, id) {
            Ok(c) => Ok((c, false)),
            Err(e) if e.is_not_found() && !retry => create(id.to_string()),
            Err(e) => Err(e.to_string()),
        },
        _ if retry => Err("conversationId is required".to_string()),
        _ => create(Uuid::new_v4().to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_turn(
    state: &Arc<AppState>,
    user: &str,
    req: &TurnRequest,
    conv: &Conversation,
    user_message_id: i64,
    assistant_id: i64,
    stream: &TurnStream,
    accum: &mut Accum,
) -> Result<(), TurnError> {
    stream
        .emit(TurnEvent::Metadata {
            conversation_id: conv.id.clone(),
            user_message_id,
        })
        .await
        .map_err(|_| TurnError::Cancelled)?;

    // ── Context ─────────────────────────────────────────────────────────────
    let system_prompt = state
        .store
        .get_setting(user, setting_keys::SYSTEM_PROMPT)
        .ok()
        .flatten()
        .or_else(|| state.config.defaults.system_prompt.clone())
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

    let reasoning_effort = state
        .store
        .get_setting(user, setting_keys::REASONING_EFFORT)
        .ok()
        .flatten()
        .and_then(|v| v.parse::<ReasoningEffort>().ok())
        .unwrap_or_default();

    let mut tools = state
        .tools
        .available_tools(user)
        .map_err(|e| TurnError::Failed(e.to_string()))?;
    if !req.web_search {
        // The builtin search rides along only when the request asked for it.
        tools.retain(|t| !(t.server_id == BUILTIN_SERVER_ID && t.name == "web_search"));
    }
    let tool_defs = to_definitions(&tools);

    let messages = state
        .store
        .get_all_conversation_messages(user, &conv.id)
        .map_err(|e| TurnError::Failed(e.to_string()))?;
    let recorded_calls = state
        .store
        .get_conversation_tool_calls(&conv.id)
        .map_err(|e| TurnError::Failed(e.to_string()))?;
    let mut context = build_context(&system_prompt, &messages, user_message_id, &recorded_calls);

    // ── Provider ────────────────────────────────────────────────────────────
    let provider = state
        .store
        .get_provider(user, &req.model.provider)
        .map_err(|e| TurnError::Failed(format!("provider {}: {e}", req.model.provider)))?;
    let client = state.registry.client_for(&provider);

    // ── Stream / tool loop ──────────────────────────────────────────────────
    for round in 0.. {
        if round >= MAX_TOOL_ROUNDS {
            return Err(TurnError::Failed(format!(
                "tool loop exceeded {MAX_TOOL_ROUNDS} iterations"
            )));
        }

        let mut chat_req = ChatRequest::new(req.model.model.clone(), context.clone());
        chat_req.tools = tool_defs.clone();
        chat_req.reasoning_effort = reasoning_effort;

        let calls = stream_one_round(state, conv, assistant_id, &client, chat_req, stream, accum)
            .await?;
        if calls.is_empty() {
            return Ok(());
        }

        debug!(round, count = calls.len(), "executing tool calls");
        let exchanged = execute_tool_calls(state, user, &tools, calls, stream).await?;

        // Extend the context with the assistant-tool-call message and one
        // tool-result message per call, then go around again.
        context.push(ChatMessage::assistant_tool_calls(
            exchanged
                .iter()
                .map(|(call, _)| WireToolCall::new(&call.ref_id, &call.name, &call.args))
                .collect(),
        ));
        for (call, output) in &exchanged {
            context.push(ChatMessage::tool_result(&call.ref_id, output));
        }
    }
    unreachable!("loop exits via return");
}

/// One streaming completion. Forwards chunks, records tool-call rows as
/// they are first observed, and returns the completed calls (empty when the
/// assistant finished without tools).
async fn stream_one_round(
    state: &Arc<AppState>,
    conv: &Conversation,
    assistant_id: i64,
    client: &Arc<dyn ChatClient>,
    chat_req: ChatRequest,
    stream: &TurnStream,
    accum: &mut Accum,
) -> Result<Vec<RecordedCall>, TurnError> {
    let (ptx, mut prx) = mpsc::channel::<StreamEvent>(64);
    let task_client = Arc::clone(client);
    let stream_task = tokio::spawn(async move {
        if let Err(e) = task_client.send_stream(&chat_req, ptx.clone()).await {
            let _ = ptx
                .send(StreamEvent::Error {
                    message: e.to_string(),
                })
                .await;
        }
    });

    let mut ledger = ToolCallLedger::new();
    let mut row_ids: HashMap<usize, String> = HashMap::new();

    let outcome = loop {
        let Some(ev) = prx.recv().await else {
            // Provider task ended without Done — treat as a broken stream.
            break Err(TurnError::Failed(
                "provider stream ended unexpectedly".to_string(),
            ));
        };
        match ev {
            StreamEvent::Content { text } => {
                accum.content.push_str(&text);
                if stream
                    .emit(TurnEvent::Chunk {
                        content: Some(text),
                        reasoning: None,
                        tool_call: None,
                    })
                    .await
                    .is_err()
                {
                    break Err(TurnError::Cancelled);
                }
            }
            StreamEvent::Reasoning { text } => {
                accum.reasoning.push_str(&text);
                if stream
                    .emit(TurnEvent::Chunk {
                        content: None,
                        reasoning: Some(text),
                        tool_call: None,
                    })
                    .await
                    .is_err()
                {
                    break Err(TurnError::Cancelled);
                }
            }
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                args_fragment,
            } => {
                let first_seen =
                    ledger.absorb(index, id.as_deref(), name.as_deref(), &args_fragment);
                if let Some((ref_id, name)) = first_seen {
                    let row_id = Uuid::new_v4().to_string();
                    let record = ToolCallRecord {
                        id: row_id.clone(),
                        ref_id,
                        conv_id: conv.id.clone(),
                        message_id: assistant_id,
                        name: name.clone(),
                        args: String::new(),
                        output: String::new(),
                        created_at: String::new(),
                    };
                    if let Err(e) = state.store.save_tool_call(&record) {
                        warn!(error = %e, "tool call insert failed");
                    }
                    row_ids.insert(index, row_id);
                    if stream
                        .emit(TurnEvent::Chunk {
                            content: None,
                            reasoning: None,
                            tool_call: Some(name),
                        })
                        .await
                        .is_err()
                    {
                        break Err(TurnError::Cancelled);
                    }
                }
            }
            StreamEvent::Done { stats, .. } => {
                accum.prompt_tokens = stats.prompt_tokens;
                accum.completion_tokens += stats.completion_tokens;
                if stats.tokens_per_second > 0.0 {
                    accum.speed = stats.tokens_per_second;
                }
                break Ok(());
            }
            StreamEvent::Error { message } => {
                break Err(TurnError::Failed(message));
            }
        }
    };
    stream_task.abort();
    outcome?;

    Ok(ledger
        .finish_indexed()
        .into_iter()
        .map(|(index, call)| RecordedCall {
            row_id: row_ids
                .remove(&index)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ref_id: call.ref_id,
            name: call.name,
            args: call.args,
        })
        .collect())
}

/// A completed tool call paired with its persisted row.
struct RecordedCall {
    row_id: String,
    ref_id: String,
    name: String,
    args: String,
}

/// Run every tool call of one assistant turn: approval gate where flagged,
/// execution, persistence, `tool-result` event. Returns call/output pairs
/// for the context extension.
async fn execute_tool_calls(
    state: &Arc<AppState>,
    user: &str,
    tools: &[ToolEntry],
    calls: Vec<RecordedCall>,
    stream: &TurnStream,
) -> Result<Vec<(RecordedCall, String)>, TurnError> {
    let mut exchanged = Vec::with_capacity(calls.len());

    for call in calls {
        let entry = tools.iter().find(|t| t.name == call.name);
        let output = match entry {
            None => format!("unknown tool: {}", call.name),
            Some(entry) => {
                let approved = if entry.require_approval {
                    // Register first so a decision posted the instant the
                    // frame lands still finds its entry.
                    let rx = state.approvals.register(
                        user,
                        PendingToolCall {
                            id: call.row_id.clone(),
                            name: call.name.clone(),
                            args: call.args.clone(),
                        },
                    );
                    let emitted = stream
                        .emit(TurnEvent::ToolAwaiting {
                            id: call.row_id.clone(),
                            name: call.name.clone(),
                            args: call.args.clone(),
                        })
                        .await;
                    if emitted.is_err() {
                        state.approvals.cancel(&call.row_id);
                        return Err(TurnError::Cancelled);
                    }
                    state.approvals.wait(&call.row_id, rx).await
                } else {
                    ApprovalOutcome::Approved
                };

                match approved {
                    ApprovalOutcome::Approved => {
                        state.tools.execute(user, entry, &call.args).await.content
                    }
                    ApprovalOutcome::Denied => DENIED_OUTPUT.to_string(),
                    ApprovalOutcome::TimedOut => TIMEOUT_OUTPUT.to_string(),
                }
            }
        };

        if let Err(e) = state.store.update_tool_call(&call.row_id, &call.args, &output) {
            warn!(error = %e, id = %call.row_id, "tool call update failed");
        }
        stream
            .emit(TurnEvent::ToolResult {
                id: call.row_id.clone(),
                output: output.clone(),
            })
            .await
            .map_err(|_| TurnError::Cancelled)?;

        exchanged.push((call, output));
    }

    Ok(exchanged)
}

fn finalize_placeholder(
    state: &AppState,
    user: &str,
    assistant_id: i64,
    accum: &Accum,
    status: MessageStatus,
    error: Option<String>,
) {
    let upd = UpdateMessage {
        content: Some(accum.content.clone()),
        reasoning: (!accum.reasoning.is_empty()).then(|| accum.reasoning.clone()),
        error,
        status: Some(status),
        token_count: Some(accum.completion_tokens),
        context_size: Some(accum.prompt_tokens),
        speed: Some(accum.speed),
    };
    if let Err(e) = state.store.update_message(user, assistant_id, &upd) {
        warn!(error = %e, assistant_id, "placeholder finalize failed");
    }
}

/// First-message prefix used until the generated title lands.
fn derive_title(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return "New chat".to_string();
    }
    let mut title: String = trimmed.chars().take(48).collect();
    if title.len() < trimmed.len() {
        title.push('…');
    }
    title
}

/// Fire-and-forget: ask the same provider for a short conversation title,
/// then rename and notify every session.
fn spawn_title_generation(state: Arc<AppState>, user: String, conv_id: String, req: TurnRequest) {
    tokio::spawn(async move {
        let Some(content) = req.content else { return };
        let provider = match state.store.get_provider(&user, &req.model.provider) {
            Ok(p) => p,
            Err(_) => return,
        };
        let client = state.registry.client_for(&provider);

        let chat_req = ChatRequest::new(
            req.model.model.clone(),
            vec![
                ChatMessage::text(
                    Role::System,
                    "Generate a title of at most five words for a conversation \
                     opening with the user message below. Reply with the title only.",
                ),
                ChatMessage::text(Role::User, content),
            ],
        );

        match client.send(&chat_req).await {
            Ok(completion) => {
                let title = completion.content.trim().trim_matches('"').to_string();
                if title.is_empty() {
                    return;
                }
                match state.store.rename_conversation(&user, &conv_id, &title) {
                    Ok(snapshot) => {
                        // Renames reach every session, the originator included.
                        state.bus.broadcast(
                            &user,
                            "",
                            SyncEvent::ConversationUpdated {
                                conversation_id: conv_id,
                                conversation: snapshot,
                            },
                        );
                    }
                    Err(e) => debug!(error = %e, "title rename failed"),
                }
            }
            Err(e) => debug!(error = %e, "title generation failed"),
        }
    });
}
