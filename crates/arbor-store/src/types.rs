use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Lifecycle of a message row. Assistant placeholders move
/// streaming → completed (or error); everything else is written completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Completed,
    Error,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Streaming => write!(f, "streaming"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "streaming" => Ok(Self::Streaming),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// One chat, owned by a single user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub user: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A node in the conversation tree. `parent_id == 0` marks a root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub conv_id: String,
    pub role: Role,
    /// Model tag (`provider/model`); assistant messages only.
    pub model: Option<String>,
    pub content: String,
    /// Hidden chain-of-thought text; assistant messages only.
    pub reasoning: Option<String>,
    pub parent_id: i64,
    pub status: MessageStatus,
    pub error: Option<String>,
    /// Completion tokens of the assistant turn.
    pub token_count: u32,
    /// Prompt tokens the provider billed for the turn.
    pub context_size: u32,
    /// Tokens per second over the streamed completion.
    pub speed: f64,
    pub created_at: String,
    /// Child message ids, ascending. Derived on read, never persisted.
    #[serde(default)]
    pub children: Vec<i64>,
}

impl Message {
    /// A fresh unsaved message with the given shape. Stats zeroed,
    /// timestamps filled by the store on insert.
    pub fn new(conv_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            conv_id: conv_id.into(),
            role,
            model: None,
            content: content.into(),
            reasoning: None,
            parent_id: 0,
            status: MessageStatus::Completed,
            error: None,
            token_count: 0,
            context_size: 0,
            speed: 0.0,
            created_at: String::new(),
            children: Vec::new(),
        }
    }
}

/// Flat id-keyed view of a conversation's messages.
pub type MessageMap = HashMap<i64, Message>;

/// Partial update for a message. `None` fields are left untouched;
/// `parent_id`, `conv_id`, and `role` can never change.
#[derive(Debug, Clone, Default)]
pub struct UpdateMessage {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub error: Option<String>,
    pub status: Option<MessageStatus>,
    pub token_count: Option<u32>,
    pub context_size: Option<u32>,
    pub speed: Option<f64>,
}

/// Links an uploaded file to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub message_id: i64,
    pub file_id: String,
}

/// A tool invocation the assistant made during a turn.
///
/// `ref_id` is the provider's own token for the call, kept verbatim so
/// assistant-tool-call / tool-result pairs correlate on re-submission.
/// `id` is the internal primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub id: String,
    pub ref_id: String,
    pub conv_id: String,
    pub message_id: i64,
    pub name: String,
    /// Argument JSON exactly as the provider emitted it.
    pub args: String,
    pub output: String,
    pub created_at: String,
}

/// A remote MCP tool host. The synthetic id `default` denotes the
/// in-process builtin host and never has a row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServer {
    pub id: String,
    pub user: String,
    pub name: String,
    pub url: String,
    pub api_key: String,
}

/// Identifier of the builtin tool host.
pub const BUILTIN_SERVER_ID: &str = "default";

/// One tool exposed to the model. Name is unique per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEntry {
    pub id: String,
    pub server_id: String,
    pub user: String,
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub require_approval: bool,
    pub is_enabled: bool,
}

/// A stored upstream LLM provider. `id` is the model-tag prefix
/// (the part before the first `/`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRecord {
    pub id: String,
    pub user: String,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
}

/// Typed setting keys the core reads. The settings table itself is
/// free-form `(user, key) → value`.
pub mod setting_keys {
    pub const SYSTEM_PROMPT: &str = "systemPrompt";
    pub const ATTACHMENT_OCR_ONLY: &str = "attachmentOcrOnly";
    pub const OCR_MODEL: &str = "ocrModel";
    pub const REASONING_EFFORT: &str = "reasoningEffort";
    pub const DEFAULT_MODEL: &str = "defaultModel";
}
