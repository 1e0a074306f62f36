use std::collections::BTreeMap;

use crate::provider::{ToolCallRequest, UsageStats};

/// Events emitted while a provider response streams.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental visible content.
    Content { text: String },

    /// Incremental hidden reasoning content. Only emitted when the
    /// request enabled a reasoning effort.
    Reasoning { text: String },

    /// Partial tool-call data. `id` and `name` arrive with the first
    /// fragment for an index; later fragments only extend the argument
    /// JSON buffer.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        args_fragment: String,
    },

    /// Stream completed.
    Done {
        stop_reason: String,
        stats: UsageStats,
    },

    /// Error during streaming.
    Error { message: String },
}

/// Parse a single SSE line from a chat-completions stream.
/// SSE format: `event: <type>\ndata: <json>\n\n`
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

/// Ordered reassembly buffer for streamed tool-call deltas.
///
/// Providers fan a tool call out over many chunks: the first carries the
/// reference id and function name for an index, the rest extend the
/// argument JSON one fragment at a time. Entries stay ordered by index so
/// the recorded call order matches the provider's.
#[derive(Debug, Default)]
pub struct ToolCallLedger {
    entries: BTreeMap<usize, LedgerEntry>,
}

#[derive(Debug, Default)]
struct LedgerEntry {
    ref_id: String,
    name: String,
    args: String,
}

impl ToolCallLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one delta into the ledger. Returns the `(ref_id, name)` pair
    /// the first time an index becomes identifiable, so the caller can
    /// record the call as soon as it is observed.
    pub fn absorb(
        &mut self,
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        args_fragment: &str,
    ) -> Option<(String, String)> {
        let entry = self.entries.entry(index).or_default();
        let was_named = !entry.name.is_empty();
        if let Some(id) = id {
            entry.ref_id = id.to_string();
        }
        if let Some(name) = name {
            entry.name = name.to_string();
        }
        entry.args.push_str(args_fragment);

        if !was_named && !entry.name.is_empty() {
            Some((entry.ref_id.clone(), entry.name.clone()))
        } else {
            None
        }
    }

    /// Drain into completed tool-call requests, index order preserved.
    /// Entries that never received a name are dropped.
    pub fn finish(self) -> Vec<ToolCallRequest> {
        self.finish_indexed().into_iter().map(|(_, c)| c).collect()
    }

    /// Like `finish`, but keeps each call's stream index so callers can
    /// correlate rows recorded at first sighting.
    pub fn finish_indexed(self) -> Vec<(usize, ToolCallRequest)> {
        self.entries
            .into_iter()
            .filter(|(_, e)| !e.name.is_empty())
            .map(|(index, e)| {
                (
                    index,
                    ToolCallRequest {
                        ref_id: e.ref_id,
                        name: e.name,
                        args: e.args,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sse_lines() {
        match parse_sse_line("data: {\"x\":1}") {
            Some(SseParsed::Data(d)) => assert_eq!(d, "{\"x\":1}"),
            other => panic!("unexpected: {other:?}"),
        }
        match parse_sse_line("event: done") {
            Some(SseParsed::Event(e)) => assert_eq!(e, "done"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(parse_sse_line(": keepalive").is_none());
    }

    #[test]
    fn ledger_reassembles_fragments_in_index_order() {
        let mut ledger = ToolCallLedger::new();

        // Name arrives with the first fragment; only then is the call known.
        let first = ledger.absorb(0, Some("call_a"), Some("get_weather"), "{\"loc");
        assert_eq!(first, Some(("call_a".to_string(), "get_weather".to_string())));
        assert!(ledger.absorb(0, None, None, "ation\":\"Paris\"}").is_none());

        // A second, interleaved call at a higher index.
        let second = ledger.absorb(1, Some("call_b"), Some("web_search"), "");
        assert_eq!(second, Some(("call_b".to_string(), "web_search".to_string())));
        ledger.absorb(1, None, None, "{\"query\":\"rust\"}");

        let calls = ledger.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].ref_id, "call_a");
        assert_eq!(calls[0].args, "{\"location\":\"Paris\"}");
        assert_eq!(calls[1].name, "web_search");
    }

    #[test]
    fn ledger_drops_nameless_entries() {
        let mut ledger = ToolCallLedger::new();
        ledger.absorb(0, None, None, "{}");
        assert!(ledger.finish().is_empty());
    }
}
