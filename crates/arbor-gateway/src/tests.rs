//! End-to-end tests: scripted provider, in-memory store, real router.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio::sync::mpsc;
use tower::ServiceExt;

use arbor_agent::approval::TIMEOUT_OUTPUT;
use arbor_agent::provider::{
    ChatClient, ChatCompletion, ChatRequest, ModelTag, ProviderError, UsageStats,
};
use arbor_agent::registry::ClientRegistry;
use arbor_agent::stream::StreamEvent;
use arbor_core::config::{ArborConfig, AuthMode};
use arbor_store::types::{Conversation, Message, MessageStatus, ProviderRecord, Role};
use arbor_store::Store;

use crate::app::{build_router, AppState};
use crate::turn::{run_turn, TurnEvent, TurnRequest};

// ── Scripted provider ────────────────────────────────────────────────────────

struct ScriptedClient {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
}

#[async_trait]
impl ChatClient for ScriptedClient {
    fn name(&self) -> &str {
        "prov-A"
    }

    async fn send(&self, _req: &ChatRequest) -> Result<ChatCompletion, ProviderError> {
        Ok(ChatCompletion {
            content: "Generated title".to_string(),
            reasoning: None,
            tool_calls: Vec::new(),
            stop_reason: "stop".to_string(),
            stats: UsageStats::default(),
        })
    }

    async fn send_stream(
        &self,
        _req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("provider called more times than scripted");
        for ev in script {
            let _ = tx.send(ev).await;
        }
        Ok(())
    }
}

struct ScriptedRegistry {
    client: Arc<ScriptedClient>,
}

impl ClientRegistry for ScriptedRegistry {
    fn client_for(&self, _provider: &ProviderRecord) -> Arc<dyn ChatClient> {
        Arc::clone(&self.client) as Arc<dyn ChatClient>
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────────

fn scripted_state(mode: AuthMode, scripts: Vec<Vec<StreamEvent>>) -> Arc<AppState> {
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    arbor_store::db::init_db(&conn).unwrap();
    let store = Arc::new(Store::new(conn));

    store.ensure_user("alice").unwrap();
    store
        .add_provider(&ProviderRecord {
            id: "prov-A".to_string(),
            user: "alice".to_string(),
            name: "Provider A".to_string(),
            base_url: "http://localhost:0".to_string(),
            api_key: "k".to_string(),
        })
        .unwrap();

    let mut config = ArborConfig::default();
    config.gateway.auth.mode = mode;
    config.gateway.auth.user = "alice".to_string();

    Arc::new(AppState::new(
        config,
        store,
        Arc::new(ScriptedRegistry {
            client: Arc::new(ScriptedClient {
                scripts: Mutex::new(scripts.into()),
            }),
        }),
    ))
}

fn done(prompt: u32, completion: u32) -> StreamEvent {
    StreamEvent::Done {
        stop_reason: "stop".to_string(),
        stats: UsageStats {
            prompt_tokens: prompt,
            completion_tokens: completion,
            tokens_per_second: 10.0,
        },
    }
}

fn content(text: &str) -> StreamEvent {
    StreamEvent::Content {
        text: text.to_string(),
    }
}

fn turn_request(conv: &str, parent_id: i64, content: Option<&str>) -> TurnRequest {
    TurnRequest {
        conversation_id: Some(conv.to_string()),
        parent_id,
        model: ModelTag::parse("prov-A/llama-3-8b").unwrap(),
        content: content.map(str::to_string),
        web_search: false,
        attached_file_ids: Vec::new(),
    }
}

/// Drive a turn to completion, answering every approval request with
/// `approve` when given.
async fn collect_turn(
    state: &Arc<AppState>,
    req: TurnRequest,
    approve: Option<bool>,
) -> Vec<TurnEvent> {
    let (tx, mut rx) = mpsc::channel(64);
    let handle = tokio::spawn(run_turn(
        Arc::clone(state),
        "alice".to_string(),
        "S1".to_string(),
        req,
        tx,
    ));

    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        if let (TurnEvent::ToolAwaiting { id, .. }, Some(decision)) = (&ev, approve) {
            assert!(state.approvals.resolve("alice", id, decision));
        }
        events.push(ev);
    }
    handle.await.unwrap();
    events
}

// ── Turn scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn first_message_streams_and_persists() {
    let state = scripted_state(
        AuthMode::None,
        vec![vec![content("hi"), content(" there"), done(5, 2)]],
    );

    let events = collect_turn(&state, turn_request("conv-x", 0, Some("hello")), None).await;

    match &events[0] {
        TurnEvent::Metadata {
            conversation_id,
            user_message_id,
        } => {
            assert_eq!(conversation_id, "conv-x");
            assert_eq!(*user_message_id, 1);
        }
        other => panic!("expected metadata first, got {other:?}"),
    }
    assert!(matches!(
        &events[1],
        TurnEvent::Chunk { content: Some(c), .. } if c == "hi"
    ));
    assert!(matches!(
        &events[2],
        TurnEvent::Chunk { content: Some(c), .. } if c == " there"
    ));
    match events.last().unwrap() {
        TurnEvent::Complete {
            user_message_id,
            assistant_message_id,
        } => {
            assert_eq!(*user_message_id, 1);
            assert_eq!(*assistant_message_id, 2);
        }
        other => panic!("expected complete last, got {other:?}"),
    }

    let map = state
        .store
        .get_all_conversation_messages("alice", "conv-x")
        .unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map[&2].content, "hi there");
    assert_eq!(map[&2].parent_id, 1);
    assert_eq!(map[&1].parent_id, 0);
    assert_eq!(map[&1].children, vec![2]);
    assert_eq!(map[&2].status, MessageStatus::Completed);
    assert_eq!(map[&2].token_count, 2);
    assert_eq!(map[&2].context_size, 5);
}

#[tokio::test]
async fn retry_creates_a_sibling_branch() {
    let state = scripted_state(
        AuthMode::None,
        vec![
            vec![content("hi"), content(" there"), done(5, 2)],
            vec![content("hello!"), done(5, 1)],
        ],
    );

    collect_turn(&state, turn_request("conv-x", 0, Some("hello")), None).await;
    let events = collect_turn(&state, turn_request("conv-x", 1, None), None).await;

    match &events[0] {
        TurnEvent::Metadata { user_message_id, .. } => assert_eq!(*user_message_id, 1),
        other => panic!("expected metadata, got {other:?}"),
    }
    match events.last().unwrap() {
        TurnEvent::Complete {
            user_message_id,
            assistant_message_id,
        } => {
            assert_eq!(*user_message_id, 1);
            assert_eq!(*assistant_message_id, 3);
        }
        other => panic!("expected complete, got {other:?}"),
    }

    let map = state
        .store
        .get_all_conversation_messages("alice", "conv-x")
        .unwrap();
    assert_eq!(map.len(), 3);
    assert_eq!(map[&1].children, vec![2, 3]);
    assert_eq!(map[&3].parent_id, 1);
    assert_eq!(map[&3].content, "hello!");
}

fn weather_call_script() -> Vec<StreamEvent> {
    vec![
        StreamEvent::ToolCallDelta {
            index: 0,
            id: Some("call_w1".to_string()),
            name: Some("get_weather".to_string()),
            args_fragment: "{\"location\":".to_string(),
        },
        StreamEvent::ToolCallDelta {
            index: 0,
            id: None,
            name: None,
            args_fragment: "\"Paris\"}".to_string(),
        },
        StreamEvent::Done {
            stop_reason: "tool_use".to_string(),
            stats: UsageStats {
                prompt_tokens: 9,
                completion_tokens: 3,
                tokens_per_second: 6.0,
            },
        },
    ]
}

#[tokio::test]
async fn approved_tool_call_runs_and_persists_output() {
    let state = scripted_state(
        AuthMode::None,
        vec![
            weather_call_script(),
            vec![content("It is sunny in Paris."), done(20, 5)],
        ],
    );

    let events = collect_turn(
        &state,
        turn_request("conv-w", 0, Some("weather in Paris?")),
        Some(true),
    )
    .await;

    let awaiting = events
        .iter()
        .find_map(|e| match e {
            TurnEvent::ToolAwaiting { id, name, args } => {
                Some((id.clone(), name.clone(), args.clone()))
            }
            _ => None,
        })
        .expect("tool-awaiting frame");
    assert_eq!(awaiting.1, "get_weather");
    assert_eq!(awaiting.2, "{\"location\":\"Paris\"}");

    let result = events
        .iter()
        .find_map(|e| match e {
            TurnEvent::ToolResult { id, output } => Some((id.clone(), output.clone())),
            _ => None,
        })
        .expect("tool-result frame");
    assert_eq!(result.0, awaiting.0);
    assert!(result.1.contains("Paris"));
    assert!(matches!(events.last().unwrap(), TurnEvent::Complete { .. }));

    // The persisted row carries the provider token, final args, and output.
    let record = state.store.get_tool_call(&awaiting.0).unwrap();
    assert_eq!(record.ref_id, "call_w1");
    assert_eq!(record.args, "{\"location\":\"Paris\"}");
    assert!(!record.output.is_empty());

    let map = state
        .store
        .get_all_conversation_messages("alice", "conv-w")
        .unwrap();
    assert_eq!(map[&2].content, "It is sunny in Paris.");
    assert_eq!(map[&2].status, MessageStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn unanswered_approval_times_out_without_error() {
    let state = scripted_state(
        AuthMode::None,
        vec![
            weather_call_script(),
            vec![content("I could not check the weather."), done(20, 5)],
        ],
    );

    let events = collect_turn(
        &state,
        turn_request("conv-w", 0, Some("weather in Paris?")),
        None,
    )
    .await;

    let (id, output) = events
        .iter()
        .find_map(|e| match e {
            TurnEvent::ToolResult { id, output } => Some((id.clone(), output.clone())),
            _ => None,
        })
        .expect("tool-result frame");
    assert_eq!(output, TIMEOUT_OUTPUT);
    assert!(!events.iter().any(|e| matches!(e, TurnEvent::Error { .. })));
    assert!(matches!(events.last().unwrap(), TurnEvent::Complete { .. }));

    assert_eq!(state.store.get_tool_call(&id).unwrap().output, TIMEOUT_OUTPUT);
}

#[tokio::test]
async fn runaway_tool_loop_halts_at_the_cap() {
    let round = || {
        vec![
            StreamEvent::ToolCallDelta {
                index: 0,
                id: Some("call_x".to_string()),
                name: Some("frobnicate".to_string()),
                args_fragment: "{}".to_string(),
            },
            StreamEvent::Done {
                stop_reason: "tool_use".to_string(),
                stats: UsageStats::default(),
            },
        ]
    };
    let state = scripted_state(AuthMode::None, (0..8).map(|_| round()).collect());

    let events = collect_turn(&state, turn_request("conv-l", 0, Some("go")), None).await;

    match events.last().unwrap() {
        TurnEvent::Error { error } => assert!(error.contains("exceeded")),
        other => panic!("expected error, got {other:?}"),
    }
    let map = state
        .store
        .get_all_conversation_messages("alice", "conv-l")
        .unwrap();
    assert_eq!(map[&2].status, MessageStatus::Error);
}

#[tokio::test]
async fn provider_stream_error_marks_placeholder() {
    let state = scripted_state(
        AuthMode::None,
        vec![vec![
            content("par"),
            StreamEvent::Error {
                message: "connection reset".to_string(),
            },
        ]],
    );

    let events = collect_turn(&state, turn_request("conv-e", 0, Some("hi")), None).await;
    assert!(matches!(events.last().unwrap(), TurnEvent::Error { .. }));

    let map = state
        .store
        .get_all_conversation_messages("alice", "conv-e")
        .unwrap();
    assert_eq!(map[&2].status, MessageStatus::Error);
    // Partial content is flushed, not lost.
    assert_eq!(map[&2].content, "par");
    assert_eq!(map[&2].error.as_deref(), Some("connection reset"));
}

// ── Router behavior ──────────────────────────────────────────────────────────

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-auth-user", "alice")
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, user: &str, session: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-auth-user", user)
        .header("x-session-id", session)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn conversation_json(id: &str) -> serde_json::Value {
    serde_json::json!({
        "conversation": {
            "id": id,
            "user": "",
            "title": "test chat",
            "createdAt": "",
            "updatedAt": "",
        }
    })
}

#[tokio::test]
async fn missing_credentials_answer_401() {
    let state = scripted_state(AuthMode::Token, vec![]);
    let router = build_router(state);

    let resp = router
        .clone()
        .oneshot(Request::builder().uri("/api/conversations").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Health stays open.
    let resp = router
        .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn conversation_crud_round_trip() {
    let state = scripted_state(AuthMode::TrustedProxy, vec![]);
    let router = build_router(state);

    let resp = router
        .clone()
        .oneshot(post_json(
            "/api/conversations/add",
            "alice",
            "S1",
            conversation_json("conv-1"),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created = body_json(resp).await;
    assert_eq!(created["id"], "conv-1");
    assert_eq!(created["user"], "alice");

    let resp = router.clone().oneshot(get("/api/conversations")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let listed = body_json(resp).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let resp = router
        .clone()
        .oneshot(post_json(
            "/api/conversations/conv-1/rename",
            "alice",
            "S1",
            serde_json::json!({ "title": "renamed" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["title"], "renamed");

    let resp = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/conversations/conv-1")
                .header("x-auth-user", "alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = router.oneshot(get("/api/conversations/conv-1")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn foreign_user_cannot_read_a_conversation() {
    let state = scripted_state(AuthMode::TrustedProxy, vec![]);
    let router = build_router(state);

    router
        .clone()
        .oneshot(post_json(
            "/api/conversations/add",
            "alice",
            "S1",
            conversation_json("conv-1"),
        ))
        .await
        .unwrap();

    let resp = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/conversations/conv-1")
                .header("x-auth-user", "bob")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn edit_preserves_structure() {
    let state = scripted_state(AuthMode::TrustedProxy, vec![]);

    // Seed: 1 (user) with assistant children 2 and 3.
    state
        .store
        .add_conversation(&Conversation {
            id: "conv-x".to_string(),
            user: "alice".to_string(),
            title: "t".to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        })
        .unwrap();
    let mut msg = Message::new("conv-x", Role::User, "hello");
    msg.parent_id = 0;
    state.store.save_message(&msg).unwrap();
    for text in ["hi there", "hello!"] {
        let mut child = Message::new("conv-x", Role::Assistant, text);
        child.parent_id = 1;
        state.store.save_message(&child).unwrap();
    }

    let router = build_router(state);
    let resp = router
        .oneshot(post_json(
            "/api/chat/update",
            "alice",
            "S1",
            serde_json::json!({
                "conversationId": "conv-x",
                "messageId": 1,
                "content": "HELLO",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    let updated = &body["messages"]["1"];
    assert_eq!(updated["content"], "HELLO");
    assert_eq!(updated["parentId"], 0);
    assert_eq!(updated["children"], serde_json::json!([2, 3]));
    assert_eq!(updated["role"], "user");
}

#[tokio::test]
async fn sync_requires_a_session_header() {
    let state = scripted_state(AuthMode::TrustedProxy, vec![]);
    let router = build_router(state);

    let resp = router
        .oneshot(get("/api/conversations/sync"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(start_paused = true)]
async fn sync_excludes_the_originating_session() {
    let state = scripted_state(AuthMode::TrustedProxy, vec![]);
    let router = build_router(state);

    let poll = |session: &str| {
        Request::builder()
            .uri("/api/conversations/sync")
            .header("x-auth-user", "alice")
            .header("x-session-id", session)
            .body(Body::empty())
            .unwrap()
    };

    let s1 = tokio::spawn(router.clone().oneshot(poll("S1")));
    let s2 = tokio::spawn(router.clone().oneshot(poll("S2")));
    // Let both pollers reach their subscriptions before mutating.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    let resp = router
        .oneshot(post_json(
            "/api/conversations/add",
            "alice",
            "S1",
            conversation_json("conv-sync"),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    // The sibling session wakes with the event.
    let resp = s2.await.unwrap().unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let event = body_json(resp).await;
    assert_eq!(event["type"], "conversationCreated");
    assert_eq!(event["conversationId"], "conv-sync");
    assert_eq!(event["conversation"]["id"], "conv-sync");

    // The originator sleeps through to its long-poll timeout.
    let resp = s1.await.unwrap().unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}
