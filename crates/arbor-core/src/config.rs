use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8723;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Deadline for a single upstream chat-completions call (one-shot or stream).
pub const PROVIDER_TIMEOUT_SECS: u64 = 300;
/// Deadline for establishing an MCP session (`initialize` round-trip).
pub const MCP_CONNECT_TIMEOUT_SECS: u64 = 30;
/// Deadline for a single MCP `tools/call`.
pub const MCP_CALL_TIMEOUT_SECS: u64 = 120;
/// How long a gated tool call waits for a human decision.
pub const APPROVAL_TIMEOUT_SECS: u64 = 120;
/// Long-poll sync window; expiry answers 204.
pub const SYNC_POLL_TIMEOUT_SECS: u64 = 45;
/// MCP sessions are evicted and closed this long after creation.
pub const MCP_SESSION_TTL_SECS: u64 = 300;
/// Assistant placeholders stuck in `streaming` longer than this are
/// swept to `error` at startup.
pub const RECOVERY_GRACE_SECS: i64 = 300;
/// Upper bound on tool-loop rounds within one assistant turn.
pub const MAX_TOOL_ROUNDS: usize = 8;
/// Per-subscriber sync queue depth; overflow drops the event.
pub const SYNC_QUEUE_CAPACITY: usize = 10;

/// Top-level config (arbor.toml + ARBOR_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArborConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

impl Default for ArborConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            defaults: DefaultsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// Shared bearer token for `token` mode.
    pub token: Option<String>,
    /// Username the token maps to; also the fixed identity in `none` mode.
    #[serde(default = "default_user")]
    pub user: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Token,
            token: Some("change-me".to_string()),
            user: default_user(),
        }
    }
}

/// How the gateway resolves the request user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// `Authorization: Bearer <token>` checked against `auth.token`;
    /// all requests act as `auth.user`.
    Token,
    /// A fronting proxy authenticates and forwards the username in
    /// the `X-Auth-User` header.
    TrustedProxy,
    /// No authentication; every request acts as `auth.user`.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Fallbacks used when a user has no stored setting.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DefaultsConfig {
    /// Model tag (`provider/model`) used when a request omits one and the
    /// user has no `defaultModel` setting.
    pub model: Option<String>,
    /// System prompt used when the user has no `systemPrompt` setting.
    pub system_prompt: Option<String>,
}

impl ArborConfig {
    /// Load config from a TOML file with ARBOR_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.arbor/arbor.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ArborConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("ARBOR_").split("_"))
            .extract()
            .map_err(|e| crate::error::ConfigError::Invalid(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.arbor/arbor.toml", home)
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.arbor/arbor.db", home)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_user() -> String {
    "local".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ArborConfig::default();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.gateway.auth.mode, AuthMode::Token);
        assert!(cfg.database.path.ends_with("arbor.db"));
    }

    #[test]
    fn auth_mode_is_kebab_case() {
        let mode: AuthMode = serde_json::from_str("\"trusted-proxy\"").unwrap();
        assert_eq!(mode, AuthMode::TrustedProxy);
    }
}
