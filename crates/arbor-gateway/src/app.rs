use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use arbor_agent::approval::ApprovalGate;
use arbor_agent::mcp::McpSessionCache;
use arbor_agent::registry::ClientRegistry;
use arbor_agent::tools::ToolSet;
use arbor_core::config::ArborConfig;
use arbor_store::Store;

use crate::sync::SyncBus;
use crate::turn::TurnTracker;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
///
/// The sync bus, approval gate, MCP session cache, and turn tracker are the
/// process-wide singletons; injecting them here lets tests substitute a
/// scripted provider registry without touching the network.
pub struct AppState {
    pub config: ArborConfig,
    pub store: Arc<Store>,
    pub registry: Arc<dyn ClientRegistry>,
    pub mcp: Arc<McpSessionCache>,
    pub tools: ToolSet,
    pub approvals: ApprovalGate,
    pub bus: SyncBus,
    pub turns: TurnTracker,
}

impl AppState {
    pub fn new(config: ArborConfig, store: Arc<Store>, registry: Arc<dyn ClientRegistry>) -> Self {
        let mcp = Arc::new(McpSessionCache::new());
        Self {
            config,
            store: Arc::clone(&store),
            registry,
            tools: ToolSet::new(store, Arc::clone(&mcp)),
            mcp,
            approvals: ApprovalGate::new(),
            bus: SyncBus::new(),
            turns: TurnTracker::new(),
        }
    }

    /// Teardown: close every subscriber channel and MCP session.
    pub fn shutdown(&self) {
        self.bus.shutdown();
        self.mcp.shutdown();
    }
}

/// Assemble the full Axum router. Everything under /api runs behind the
/// auth middleware except the health probe.
pub fn build_router(state: Arc<AppState>) -> Router {
    let authed = Router::new()
        .route("/chat/stream", post(crate::http::chat::stream_handler))
        .route("/chat/retry/stream", post(crate::http::chat::retry_handler))
        .route("/chat/update", post(crate::http::chat::update_handler))
        .route("/chat/resume", get(crate::http::chat::resume_handler))
        .route(
            "/conversations",
            get(crate::http::conversations::list_handler),
        )
        .route(
            "/conversations/add",
            post(crate::http::conversations::add_handler),
        )
        .route("/conversations/sync", get(crate::http::sync::poll_handler))
        .route(
            "/conversations/{id}",
            get(crate::http::conversations::get_handler)
                .delete(crate::http::conversations::delete_handler),
        )
        .route(
            "/conversations/{id}/rename",
            post(crate::http::conversations::rename_handler),
        )
        .route(
            "/conversations/{id}/messages",
            get(crate::http::conversations::messages_handler),
        )
        .route("/tools/approve", post(crate::http::tools::approve_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            crate::auth::require_user,
        ));

    Router::new()
        .nest(
            "/api",
            Router::new()
                .route("/health", get(crate::http::health::health_handler))
                .merge(authed),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
}
