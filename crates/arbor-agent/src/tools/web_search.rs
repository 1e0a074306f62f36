use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{BuiltinTool, ToolResult};

const MAX_RESULTS: usize = 10;

/// Web search through the Brave Search API.
#[derive(Default)]
pub struct WebSearchTool {
    /// Optional API key override (falls back to env BRAVE_API_KEY).
    pub api_key: Option<String>,
}

#[async_trait]
impl BuiltinTool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Real-time web search. Returns a ranked result list with titles, \
         URLs and snippets. count: 1-10 (default 5)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query"
                },
                "count": {
                    "type": "integer",
                    "description": "Number of results to return (default 5, max 10)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: &str) -> ToolResult {
        let parsed: Value = match serde_json::from_str(args) {
            Ok(v) => v,
            Err(e) => return ToolResult::error(format!("invalid arguments: {e}")),
        };
        let query = match parsed.get("query").and_then(|v| v.as_str()) {
            Some(q) if !q.is_empty() => q.to_string(),
            _ => return ToolResult::error("missing 'query'"),
        };
        let count = parsed
            .get("count")
            .and_then(|v| v.as_u64())
            .unwrap_or(5)
            .min(MAX_RESULTS as u64) as usize;

        debug!(query = %query, count, "web_search tool");

        let api_key = self
            .api_key
            .clone()
            .or_else(|| std::env::var("BRAVE_API_KEY").ok());
        let Some(api_key) = api_key else {
            return ToolResult::error(
                "No search API key configured. Set the BRAVE_API_KEY environment variable.",
            );
        };

        match brave_search(&query, count, &api_key).await {
            Ok(results) => ToolResult::success(results),
            Err(e) => ToolResult::error(format!("search error: {e}")),
        }
    }
}

async fn brave_search(query: &str, count: usize, api_key: &str) -> Result<String, reqwest::Error> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .user_agent("arbor/0.3")
        .build()?;

    let resp = client
        .get("https://api.search.brave.com/res/v1/web/search")
        .query(&[("q", query), ("count", &count.to_string())])
        .header("Accept", "application/json")
        .header("X-Subscription-Token", api_key)
        .send()
        .await?
        .error_for_status()?;

    let body: Value = resp.json().await?;
    let results = body
        .get("web")
        .and_then(|w| w.get("results"))
        .and_then(|r| r.as_array())
        .map(|arr| arr.as_slice())
        .unwrap_or(&[]);

    if results.is_empty() {
        return Ok("(no results)".to_string());
    }

    let mut output = Vec::new();
    for (i, r) in results.iter().enumerate().take(count) {
        let title = r
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("(no title)");
        let url = r.get("url").and_then(|v| v.as_str()).unwrap_or("");
        let desc = r.get("description").and_then(|v| v.as_str()).unwrap_or("");
        output.push(format!("{}. {}\n   {}\n   {}", i + 1, title, url, desc));
    }
    Ok(output.join("\n\n"))
}
