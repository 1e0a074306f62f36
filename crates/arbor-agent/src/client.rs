use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use arbor_store::types::ProviderRecord;

use crate::provider::{
    ChatClient, ChatCompletion, ChatRequest, ProviderError, ToolCallRequest, UsageStats,
};
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

/// Chat-completions client for one stored provider.
pub struct HttpChatClient {
    http: reqwest::Client,
    provider_id: String,
    api_key: String,
    base_url: String,
    /// Path appended to base_url. Default: "/v1/chat/completions"
    chat_path: String,
}

impl HttpChatClient {
    /// Build a client from a stored provider record.
    /// `base_url` should NOT include a trailing slash.
    pub fn new(http: reqwest::Client, provider: &ProviderRecord) -> Self {
        Self {
            http,
            provider_id: provider.id.clone(),
            api_key: provider.api_key.clone(),
            base_url: provider.base_url.trim_end_matches('/').to_string(),
            chat_path: "/v1/chat/completions".to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, self.chat_path)
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    fn name(&self) -> &str {
        &self.provider_id
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatCompletion, ProviderError> {
        let body = build_request_body(req, false);

        debug!(provider = %self.provider_id, model = %req.model, "sending chat completion");
        let started = Instant::now();

        let resp = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .timeout(req.timeout)
            .json(&body)
            .send()
            .await?;

        check_status(resp.status().as_u16(), &resp)?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "provider API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp, started.elapsed().as_secs_f64()))
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req, true);

        debug!(provider = %self.provider_id, model = %req.model, "sending streaming chat completion");

        let resp = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .timeout(req.timeout)
            .json(&body)
            .send()
            .await?;

        check_status(resp.status().as_u16(), &resp)?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "provider streaming API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        process_stream(resp, tx).await;
        Ok(())
    }
}

fn check_status(status: u16, resp: &reqwest::Response) -> Result<(), ProviderError> {
    if status == 429 {
        let retry = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|s| s * 1000)
            .unwrap_or(5000);
        return Err(ProviderError::RateLimited {
            retry_after_ms: retry,
        });
    }
    Ok(())
}

pub(crate) fn build_request_body(req: &ChatRequest, stream: bool) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": req.model,
        "messages": req.messages,
        "stream": stream,
    });

    if stream {
        // Ask OpenAI-compatible servers to attach usage to the final chunk.
        body["stream_options"] = serde_json::json!({ "include_usage": true });
    }

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = serde_json::json!(tools);
    }

    if let Some(effort) = req.reasoning_effort.as_wire() {
        body["reasoning_effort"] = serde_json::json!(effort);
    }

    body
}

pub(crate) fn parse_response(resp: ApiResponse, elapsed_secs: f64) -> ChatCompletion {
    let choice = resp.choices.into_iter().next();
    let content = choice
        .as_ref()
        .and_then(|c| c.message.content.as_deref())
        .unwrap_or("")
        .to_string();
    let reasoning = choice
        .as_ref()
        .and_then(|c| c.message.reasoning_content.clone())
        .filter(|r| !r.is_empty());

    // Argument JSON stays a string; only in-process tools parse it.
    let tool_calls: Vec<ToolCallRequest> = choice
        .as_ref()
        .and_then(|c| c.message.tool_calls.as_ref())
        .map(|calls| {
            calls
                .iter()
                .map(|tc| ToolCallRequest {
                    ref_id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    args: tc.function.arguments.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    let stop_reason = canonical_stop_reason(
        &choice.and_then(|c| c.finish_reason).unwrap_or_default(),
    );

    let prompt_tokens = resp.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0);
    let completion_tokens = resp
        .usage
        .as_ref()
        .map(|u| u.completion_tokens)
        .unwrap_or(0);

    ChatCompletion {
        content,
        reasoning,
        tool_calls,
        stop_reason,
        stats: UsageStats {
            prompt_tokens,
            completion_tokens,
            tokens_per_second: tokens_per_second(completion_tokens, elapsed_secs),
        },
    }
}

/// Providers say `tool_calls` when the model wants tools; the turn loop
/// checks for the canonical `tool_use`.
fn canonical_stop_reason(raw: &str) -> String {
    if raw == "tool_calls" {
        "tool_use".to_string()
    } else {
        raw.to_string()
    }
}

fn tokens_per_second(completion_tokens: u32, elapsed_secs: f64) -> f64 {
    if elapsed_secs > 0.0 {
        completion_tokens as f64 / elapsed_secs
    } else {
        0.0
    }
}

/// Read a chat-completions SSE body and emit StreamEvents.
/// Each `data:` line is a JSON delta object; `data: [DONE]` ends the stream.
pub(crate) async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let started = Instant::now();
    let mut prompt_tokens: u32 = 0;
    let mut completion_tokens: u32 = 0;
    let mut stop_reason = String::new();
    let mut line_buf = String::new();

    let mut byte_stream = resp.bytes_stream();

    'outer: while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some(SseParsed::Data(data)) = parse_sse_line(line) else {
                continue;
            };

            if data.trim() == "[DONE]" {
                break 'outer;
            }

            let Ok(delta) = serde_json::from_str::<StreamChunk>(&data) else {
                continue;
            };

            if let Some(usage) = &delta.usage {
                prompt_tokens = usage.prompt_tokens;
                completion_tokens = usage.completion_tokens;
            }

            for choice in &delta.choices {
                if let Some(reason) = &choice.finish_reason {
                    if !reason.is_empty() {
                        stop_reason = canonical_stop_reason(reason);
                    }
                }
                if let Some(content) = &choice.delta.content {
                    if !content.is_empty()
                        && tx
                            .send(StreamEvent::Content {
                                text: content.clone(),
                            })
                            .await
                            .is_err()
                    {
                        return; // receiver dropped
                    }
                }
                if let Some(reasoning) = &choice.delta.reasoning_content {
                    if !reasoning.is_empty()
                        && tx
                            .send(StreamEvent::Reasoning {
                                text: reasoning.clone(),
                            })
                            .await
                            .is_err()
                    {
                        return;
                    }
                }
                if let Some(tool_calls) = &choice.delta.tool_calls {
                    for tc in tool_calls {
                        let sent = tx
                            .send(StreamEvent::ToolCallDelta {
                                index: tc.index.unwrap_or(0),
                                id: tc.id.clone(),
                                name: tc.function.name.clone(),
                                args_fragment: tc.function.arguments.clone(),
                            })
                            .await;
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }

        line_buf = remainder;
    }

    let elapsed = started.elapsed().as_secs_f64();
    let _ = tx
        .send(StreamEvent::Done {
            stop_reason,
            stats: UsageStats {
                prompt_tokens,
                completion_tokens,
                tokens_per_second: tokens_per_second(completion_tokens, elapsed),
            },
        })
        .await;
}

// Chat-completions response types

#[derive(Deserialize)]
pub(crate) struct ApiResponse {
    pub(crate) choices: Vec<Choice>,
    pub(crate) usage: Option<Usage>,
}

#[derive(Deserialize)]
pub(crate) struct Choice {
    pub(crate) message: ApiMessage,
    pub(crate) finish_reason: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ApiMessage {
    pub(crate) content: Option<String>,
    pub(crate) reasoning_content: Option<String>,
    pub(crate) tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
pub(crate) struct ApiToolCall {
    pub(crate) id: String,
    pub(crate) function: ApiFunction,
}

#[derive(Deserialize)]
pub(crate) struct ApiFunction {
    pub(crate) name: String,
    pub(crate) arguments: String,
}

#[derive(Deserialize)]
pub(crate) struct Usage {
    pub(crate) prompt_tokens: u32,
    pub(crate) completion_tokens: u32,
}

// Streaming chunk types

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    index: Option<usize>,
    id: Option<String>,
    function: StreamFunction,
}

#[derive(Deserialize)]
struct StreamFunction {
    name: Option<String>,
    /// Always present but may be an empty string.
    #[serde(default)]
    arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, ReasoningEffort, ToolDefinition};
    use arbor_store::types::Role;

    fn request_with_tools() -> ChatRequest {
        let mut req = ChatRequest::new(
            "llama-3-8b",
            vec![
                ChatMessage::text(Role::System, "be helpful"),
                ChatMessage::text(Role::User, "hello"),
            ],
        );
        req.tools = vec![ToolDefinition {
            name: "get_weather".to_string(),
            description: "weather lookup".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": { "location": { "type": "string" } },
                "required": ["location"]
            }),
        }];
        req.reasoning_effort = ReasoningEffort::Low;
        req
    }

    #[test]
    fn body_carries_tools_and_reasoning() {
        let body = build_request_body(&request_with_tools(), true);
        assert_eq!(body["model"], "llama-3-8b");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["reasoning_effort"], "low");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "get_weather");
        // The JSON-schema input spec is forwarded verbatim.
        assert_eq!(
            body["tools"][0]["function"]["parameters"]["required"][0],
            "location"
        );
        assert_eq!(body["messages"][0]["role"], "system");
    }

    #[test]
    fn disabled_reasoning_omits_the_field() {
        let mut req = request_with_tools();
        req.reasoning_effort = ReasoningEffort::Disabled;
        let body = build_request_body(&req, false);
        assert!(body.get("reasoning_effort").is_none());
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn parses_tool_call_response() {
        let raw = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {
                            "name": "get_weather",
                            "arguments": "{\"location\":\"Paris\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 7 }
        });
        let resp: ApiResponse = serde_json::from_value(raw).unwrap();
        let completion = parse_response(resp, 2.0);

        assert_eq!(completion.stop_reason, "tool_use");
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].ref_id, "call_abc");
        assert_eq!(completion.tool_calls[0].args, "{\"location\":\"Paris\"}");
        assert_eq!(completion.stats.prompt_tokens, 12);
        assert!((completion.stats.tokens_per_second - 3.5).abs() < 1e-9);
    }

    #[test]
    fn parses_reasoning_content() {
        let raw = serde_json::json!({
            "choices": [{
                "message": { "content": "4", "reasoning_content": "2+2" },
                "finish_reason": "stop"
            }],
            "usage": null
        });
        let resp: ApiResponse = serde_json::from_value(raw).unwrap();
        let completion = parse_response(resp, 1.0);
        assert_eq!(completion.content, "4");
        assert_eq!(completion.reasoning.as_deref(), Some("2+2"));
        assert_eq!(completion.stop_reason, "stop");
    }
}
