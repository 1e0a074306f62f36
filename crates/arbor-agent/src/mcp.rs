//! MCP client sessions — JSON-RPC 2.0 over HTTP.
//!
//! One session per configured server, cached process-wide. Sessions are
//! established with `initialize` (the server may hand back an
//! `Mcp-Session-Id` to thread through follow-up calls) and evicted five
//! minutes after creation, or immediately when a call fails so the next
//! call reconnects.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use arbor_core::config::{MCP_CALL_TIMEOUT_SECS, MCP_CONNECT_TIMEOUT_SECS, MCP_SESSION_TTL_SECS};
use arbor_store::types::McpServer;

pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("MCP error ({code}): {message}")]
    Rpc { code: i64, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("tool failed: {0}")]
    Failed(String),
}

/// An open session to one MCP server.
pub struct McpSession {
    http: reqwest::Client,
    url: String,
    api_key: String,
    /// Session id the server assigned during `initialize`, if any.
    session_id: OnceLock<String>,
    next_id: AtomicI64,
}

impl McpSession {
    /// Establish a session: `initialize` round-trip bounded at 30 seconds.
    pub async fn connect(server: &McpServer) -> Result<Self, ToolError> {
        let session = Self {
            http: reqwest::Client::new(),
            url: server.url.clone(),
            api_key: server.api_key.clone(),
            session_id: OnceLock::new(),
            next_id: AtomicI64::new(1),
        };

        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "arbor",
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        session
            .rpc(
                "initialize",
                params,
                Duration::from_secs(MCP_CONNECT_TIMEOUT_SECS),
            )
            .await?;

        debug!(server = %server.id, url = %server.url, "MCP session established");
        Ok(session)
    }

    /// Invoke one tool, bounded at two minutes. Text content blocks are
    /// concatenated into the result string; `isError` surfaces as `Failed`.
    pub async fn call_tool(&self, name: &str, args_json: &str) -> Result<String, ToolError> {
        // The wire form of arguments is a string; decode only to embed it
        // into the RPC params object.
        let arguments: Value = if args_json.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(args_json)
                .map_err(|e| ToolError::Parse(format!("tool arguments: {e}")))?
        };

        let result = self
            .rpc(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
                Duration::from_secs(MCP_CALL_TIMEOUT_SECS),
            )
            .await?;

        let text: String = result
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        if result
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return Err(ToolError::Failed(text));
        }
        Ok(text)
    }

    /// One JSON-RPC round-trip. Captures `Mcp-Session-Id` from the first
    /// response and threads it through subsequent requests.
    async fn rpc(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut req = self
            .http
            .post(&self.url)
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .timeout(timeout)
            .json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        if let Some(sid) = self.session_id.get() {
            req = req.header("Mcp-Session-Id", sid);
        }

        let resp = req.send().await?;

        if let Some(sid) = resp
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|v| v.to_str().ok())
        {
            let _ = self.session_id.set(sid.to_string());
        }

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ToolError::Rpc {
                code: status.as_u16() as i64,
                message,
            });
        }

        let envelope: Value = resp
            .json()
            .await
            .map_err(|e| ToolError::Parse(e.to_string()))?;

        if let Some(err) = envelope.get("error") {
            return Err(ToolError::Rpc {
                code: err.get("code").and_then(|c| c.as_i64()).unwrap_or(-32000),
                message: err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }

        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// Process-wide cache of open MCP sessions, keyed by server id.
///
/// Per-key store/load/delete is atomic through the concurrent map; there is
/// no structural lock. Every eviction timer selects against the cache's
/// shutdown token and is the only waiter here that outlives a request —
/// bounded by the five-minute TTL.
pub struct McpSessionCache {
    sessions: Arc<DashMap<String, Arc<McpSession>>>,
    shutdown: CancellationToken,
}

impl McpSessionCache {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Return the cached session for a server or establish a fresh one.
    /// A new session gets a detached TTL timer that evicts it.
    pub async fn session(&self, server: &McpServer) -> Result<Arc<McpSession>, ToolError> {
        if let Some(existing) = self.sessions.get(&server.id) {
            return Ok(existing.clone());
        }

        let session = Arc::new(McpSession::connect(server).await?);
        self.sessions.insert(server.id.clone(), session.clone());

        let sessions = Arc::clone(&self.sessions);
        let shutdown = self.shutdown.clone();
        let server_id = server.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(MCP_SESSION_TTL_SECS)) => {
                    debug!(server = %server_id, "MCP session TTL expired");
                    sessions.remove(&server_id);
                }
            }
        });

        Ok(session)
    }

    /// Execute one tool call through the cached session. A failing call
    /// evicts the session so the next attempt reconnects.
    pub async fn call_tool(
        &self,
        server: &McpServer,
        name: &str,
        args_json: &str,
    ) -> Result<String, ToolError> {
        let session = self.session(server).await?;
        match session.call_tool(name, args_json).await {
            Ok(output) => Ok(output),
            Err(e) => {
                warn!(server = %server.id, tool = name, error = %e, "MCP call failed, evicting session");
                self.evict(&server.id);
                Err(e)
            }
        }
    }

    pub fn evict(&self, server_id: &str) {
        self.sessions.remove(server_id);
    }

    /// Teardown: cancel eviction timers and drop every session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.sessions.clear();
    }
}

impl Default for McpSessionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_stub(id: &str) -> Arc<McpSessionCache> {
        let cache = Arc::new(McpSessionCache::new());
        let session = Arc::new(McpSession {
            http: reqwest::Client::new(),
            url: "http://localhost:0".to_string(),
            api_key: String::new(),
            session_id: OnceLock::new(),
            next_id: AtomicI64::new(1),
        });
        cache.sessions.insert(id.to_string(), session);
        cache
    }

    #[tokio::test]
    async fn eviction_removes_the_session() {
        let cache = cache_with_stub("srv-1");
        assert!(cache.sessions.contains_key("srv-1"));
        cache.evict("srv-1");
        assert!(!cache.sessions.contains_key("srv-1"));
    }

    #[tokio::test]
    async fn shutdown_clears_all_sessions() {
        let cache = cache_with_stub("srv-1");
        cache.shutdown();
        assert!(cache.sessions.is_empty());
        assert!(cache.shutdown.is_cancelled());
    }
}
