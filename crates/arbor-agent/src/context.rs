//! Context reconstruction — turns a tree path into the provider payload.

use std::collections::HashMap;

use arbor_store::tree::path_to_root;
use arbor_store::types::{MessageMap, Role, ToolCallRecord};

use crate::provider::{ChatMessage, WireToolCall};

/// Build the exact message sequence the provider receives for one turn.
///
/// The synthetic system-prompt message comes first, then the root-to-leaf
/// path. An assistant node that recorded tool calls contributes, before its
/// own content, an assistant message carrying the calls (reference id, name,
/// argument JSON) followed by one tool message per call (same reference id,
/// output), in recorded order.
pub fn build_context(
    system_prompt: &str,
    messages: &MessageMap,
    leaf: i64,
    tool_calls: &HashMap<i64, Vec<ToolCallRecord>>,
) -> Vec<ChatMessage> {
    let mut context = Vec::new();
    if !system_prompt.is_empty() {
        context.push(ChatMessage::text(Role::System, system_prompt));
    }

    for id in path_to_root(messages, leaf) {
        let Some(msg) = messages.get(&id) else {
            continue;
        };

        if msg.role == Role::Assistant {
            if let Some(calls) = tool_calls.get(&id).filter(|c| !c.is_empty()) {
                context.push(ChatMessage::assistant_tool_calls(
                    calls
                        .iter()
                        .map(|c| WireToolCall::new(&c.ref_id, &c.name, &c.args))
                        .collect(),
                ));
                for call in calls {
                    context.push(ChatMessage::tool_result(&call.ref_id, &call.output));
                }
            }
            if !msg.content.is_empty() {
                context.push(ChatMessage::text(Role::Assistant, &msg.content));
            }
            continue;
        }

        context.push(ChatMessage::text(msg.role, &msg.content));
    }

    context
}
