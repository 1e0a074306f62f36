//! Tool system — builtin tools plus the user's MCP-hosted tools.
//!
//! `ToolSet` is the single answer to "what can this user's model call and
//! how does a call run": builtins execute in-process, everything else goes
//! through the MCP session cache.

pub mod weather;
pub mod web_search;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use arbor_store::types::{ToolEntry, BUILTIN_SERVER_ID};
use arbor_store::{Store, StoreError};

use crate::mcp::McpSessionCache;
use crate::provider::ToolDefinition;

/// Result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Text returned to the model (and persisted as the call output).
    pub content: String,
    /// Whether the tool execution failed.
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// Trait implemented by every in-process tool.
///
/// Arguments arrive as the raw JSON string the provider emitted; tools
/// parse only what they need.
#[async_trait]
pub trait BuiltinTool: Send + Sync {
    /// Unique name (e.g. "web_search").
    fn name(&self) -> &str;
    /// Human-readable description shown to the model.
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Whether calls must pass the approval gate by default.
    fn require_approval(&self) -> bool {
        false
    }
    /// Execute with the provider-supplied argument JSON.
    async fn execute(&self, args: &str) -> ToolResult;
}

/// Tool enumeration and execution for one process.
pub struct ToolSet {
    store: Arc<Store>,
    mcp: Arc<McpSessionCache>,
    builtins: Vec<Arc<dyn BuiltinTool>>,
}

impl ToolSet {
    /// Assemble the set with the standard builtins registered.
    pub fn new(store: Arc<Store>, mcp: Arc<McpSessionCache>) -> Self {
        Self {
            store,
            mcp,
            builtins: vec![
                Arc::new(web_search::WebSearchTool::default()),
                Arc::new(weather::WeatherTool),
            ],
        }
    }

    /// Every tool the user's model may call: enabled rows from the user's
    /// MCP servers, plus the builtins attached to the synthetic `default`
    /// host. A stored row with a builtin's name overrides the builtin.
    pub fn available_tools(&self, user: &str) -> Result<Vec<ToolEntry>, StoreError> {
        let mut tools = self.store.get_enabled_tools(user)?;
        for builtin in &self.builtins {
            if tools.iter().any(|t| t.name == builtin.name()) {
                continue;
            }
            tools.push(ToolEntry {
                id: builtin.name().to_string(),
                server_id: BUILTIN_SERVER_ID.to_string(),
                user: user.to_string(),
                name: builtin.name().to_string(),
                description: builtin.description().to_string(),
                input_schema: builtin.input_schema(),
                require_approval: builtin.require_approval(),
                is_enabled: true,
            });
        }
        Ok(tools)
    }

    /// Execute one tool call. Builtin names run in-process; anything else
    /// resolves its MCP server and goes through the session cache.
    pub async fn execute(&self, user: &str, entry: &ToolEntry, args: &str) -> ToolResult {
        debug!(tool = %entry.name, server = %entry.server_id, "executing tool");

        if entry.server_id == BUILTIN_SERVER_ID {
            return match self.builtins.iter().find(|b| b.name() == entry.name) {
                Some(tool) => tool.execute(args).await,
                None => ToolResult::error(format!("unknown builtin tool: {}", entry.name)),
            };
        }

        let server = match self.store.get_mcp_server(user, &entry.server_id) {
            Ok(s) => s,
            Err(e) => return ToolResult::error(format!("tool host unavailable: {e}")),
        };
        match self.mcp.call_tool(&server, &entry.name, args).await {
            Ok(output) => ToolResult::success(output),
            Err(e) => ToolResult::error(format!("tool call failed: {e}")),
        }
    }
}

/// Convert tool entries to the definitions sent to the provider.
/// The JSON-schema input spec travels verbatim.
pub fn to_definitions(tools: &[ToolEntry]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name.clone(),
            description: t.description.clone(),
            input_schema: t.input_schema.clone(),
        })
        .collect()
}
