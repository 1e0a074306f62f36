use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use arbor_store::types::Role;

use crate::stream::StreamEvent;

/// A `provider/model` tag. The prefix before the first `/` selects a stored
/// provider (base URL + API key); the remainder is the provider-native
/// model name and may itself contain slashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTag {
    pub provider: String,
    pub model: String,
}

impl ModelTag {
    pub fn parse(tag: &str) -> Result<Self, ProviderError> {
        match tag.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Ok(Self {
                provider: provider.to_string(),
                model: model.to_string(),
            }),
            _ => Err(ProviderError::BadModelTag(tag.to_string())),
        }
    }
}

impl std::fmt::Display for ModelTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// How much hidden chain-of-thought the model may spend. Passed through
/// to the provider verbatim; `Disabled` omits the field entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    #[default]
    Disabled,
    Minimal,
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    /// Wire value, or `None` when reasoning is disabled.
    pub fn as_wire(&self) -> Option<&'static str> {
        match self {
            Self::Disabled => None,
            Self::Minimal => Some("minimal"),
            Self::Low => Some("low"),
            Self::Medium => Some("medium"),
            Self::High => Some("high"),
        }
    }
}

impl std::str::FromStr for ReasoningEffort {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "minimal" => Ok(Self::Minimal),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown reasoning effort: {other}")),
        }
    }
}

/// One message of the provider context, in chat-completions shape.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Set on assistant messages that requested tool calls.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<WireToolCall>,
    /// Set on `tool` role messages carrying a result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Assistant message carrying tool-call requests and no content.
    pub fn assistant_tool_calls(calls: Vec<WireToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    /// Tool-role message correlating a result back to its call.
    pub fn tool_result(ref_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(output.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(ref_id.into()),
        }
    }
}

/// A tool call as it travels in the request body.
#[derive(Debug, Clone, Serialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: &'static str,
    pub function: WireFunction,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireFunction {
    pub name: String,
    /// Argument JSON kept verbatim as a string; the provider owns encoding.
    pub arguments: String,
}

impl WireToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: "function",
            function: WireFunction {
                name: name.into(),
                arguments: args.into(),
            },
        }
    }
}

/// Tool definition sent to the provider. The JSON-schema input spec is
/// forwarded verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A completed tool call extracted from a provider response.
/// `ref_id` is the provider's exact correlation token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    pub ref_id: String,
    pub name: String,
    /// Argument JSON text exactly as emitted.
    pub args: String,
}

/// Token accounting for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageStats {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub tokens_per_second: f64,
}

/// Request to an upstream provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Provider-native model name (the part after the tag's first `/`).
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub reasoning_effort: ReasoningEffort,
    /// Per-call deadline.
    pub timeout: Duration,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            reasoning_effort: ReasoningEffort::Disabled,
            timeout: Duration::from_secs(arbor_core::config::PROVIDER_TIMEOUT_SECS),
        }
    }
}

/// Full (non-streaming) completion.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    /// Canonical stop reason; provider-specific `tool_calls` is mapped
    /// to `tool_use`.
    pub stop_reason: String,
    pub stats: UsageStats,
}

/// Common interface to any chat-completions upstream.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Provider id for logging and error messages.
    fn name(&self) -> &str;

    /// Send a request and wait for the full response.
    async fn send(&self, req: &ChatRequest) -> Result<ChatCompletion, ProviderError>;

    /// Stream response events through a channel. The final event is
    /// `Done` (with usage) or `Error`.
    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid model tag: {0}")]
    BadModelTag(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("operation cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_tag_splits_at_first_slash() {
        let tag = ModelTag::parse("prov-A/llama-3-8b").unwrap();
        assert_eq!(tag.provider, "prov-A");
        assert_eq!(tag.model, "llama-3-8b");

        // The model half may contain slashes of its own.
        let nested = ModelTag::parse("openrouter/meta/llama-3").unwrap();
        assert_eq!(nested.provider, "openrouter");
        assert_eq!(nested.model, "meta/llama-3");
    }

    #[test]
    fn model_tag_rejects_malformed_input() {
        assert!(ModelTag::parse("no-slash").is_err());
        assert!(ModelTag::parse("/model").is_err());
        assert!(ModelTag::parse("prov/").is_err());
        assert!(ModelTag::parse("").is_err());
    }

    #[test]
    fn reasoning_effort_wire_values() {
        assert_eq!(ReasoningEffort::Disabled.as_wire(), None);
        assert_eq!(ReasoningEffort::High.as_wire(), Some("high"));
        assert_eq!("medium".parse::<ReasoningEffort>().unwrap(), ReasoningEffort::Medium);
    }

    #[test]
    fn chat_message_serializes_to_chat_completions_shape() {
        let msg = ChatMessage::assistant_tool_calls(vec![WireToolCall::new(
            "call_1",
            "get_weather",
            "{\"location\":\"Paris\"}",
        )]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert!(json.get("content").is_none());
        assert_eq!(json["tool_calls"][0]["id"], "call_1");
        assert_eq!(json["tool_calls"][0]["type"], "function");
        assert_eq!(json["tool_calls"][0]["function"]["name"], "get_weather");

        let result = ChatMessage::tool_result("call_1", "sunny");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_1");
        assert_eq!(json["content"], "sunny");
    }
}
