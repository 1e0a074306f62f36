//! SSE framing for the chat stream.
//!
//! Frames: `metadata`, unnamed content/reasoning chunks, `tool-awaiting`,
//! `tool-result`, `complete`, `error`. Each data line is one compact JSON
//! document; the transport flushes per frame (axum's Sse writes each event
//! as it is produced).

use axum::http::HeaderValue;
use axum::response::sse::Event;
use serde_json::json;

use crate::turn::TurnEvent;

/// Convert one turn event into its SSE frame.
pub fn frame(ev: &TurnEvent) -> Event {
    let (name, data) = payload(ev);
    let event = Event::default().data(data);
    match name {
        Some(n) => event.event(n),
        None => event,
    }
}

/// The `(event name, data line)` pair for a turn event. Chunk frames are
/// unnamed and carry only the fields that are present.
pub fn payload(ev: &TurnEvent) -> (Option<&'static str>, String) {
    match ev {
        TurnEvent::Metadata {
            conversation_id,
            user_message_id,
        } => (
            Some("metadata"),
            json!({
                "conversationId": conversation_id,
                "userMessageId": user_message_id,
            })
            .to_string(),
        ),

        TurnEvent::Chunk {
            content,
            reasoning,
            tool_call,
        } => {
            let mut body = serde_json::Map::new();
            if let Some(c) = content {
                body.insert("content".to_string(), json!(c));
            }
            if let Some(r) = reasoning {
                body.insert("reasoning".to_string(), json!(r));
            }
            if let Some(t) = tool_call {
                body.insert("tool_call".to_string(), json!(t));
            }
            (None, serde_json::Value::Object(body).to_string())
        }

        TurnEvent::ToolAwaiting { id, name, args } => (
            Some("tool-awaiting"),
            json!({ "id": id, "name": name, "args": args }).to_string(),
        ),

        TurnEvent::ToolResult { id, output } => (
            Some("tool-result"),
            json!({ "id": id, "output": output }).to_string(),
        ),

        TurnEvent::Complete {
            user_message_id,
            assistant_message_id,
        } => (
            Some("complete"),
            json!({
                "userMessageId": user_message_id,
                "assistantMessageId": assistant_message_id,
            })
            .to_string(),
        ),

        TurnEvent::Error { error } => (
            Some("error"),
            json!({ "error": error }).to_string(),
        ),
    }
}

/// Response headers the stream carries besides `text/event-stream`:
/// caching off, proxy buffering hinted off.
pub fn stream_headers() -> [(axum::http::HeaderName, HeaderValue); 2] {
    [
        (
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ),
        (
            axum::http::HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_frames_carry_only_present_fields() {
        let (name, data) = payload(&TurnEvent::Chunk {
            content: Some("hi".to_string()),
            reasoning: None,
            tool_call: None,
        });
        assert_eq!(name, None);
        assert_eq!(data, "{\"content\":\"hi\"}");
    }

    #[test]
    fn metadata_frame_is_named_and_compact() {
        let (name, data) = payload(&TurnEvent::Metadata {
            conversation_id: "conv-x".to_string(),
            user_message_id: 1,
        });
        assert_eq!(name, Some("metadata"));
        assert_eq!(data, "{\"conversationId\":\"conv-x\",\"userMessageId\":1}");
    }

    #[test]
    fn complete_frame_carries_both_ids() {
        let (name, data) = payload(&TurnEvent::Complete {
            user_message_id: 1,
            assistant_message_id: 2,
        });
        assert_eq!(name, Some("complete"));
        let parsed: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(parsed["userMessageId"], 1);
        assert_eq!(parsed["assistantMessageId"], 2);
    }
}
