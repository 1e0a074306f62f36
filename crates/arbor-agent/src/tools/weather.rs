use async_trait::async_trait;
use serde_json::{json, Value};

use super::{BuiltinTool, ToolResult};

/// Canned weather lookup.
///
/// Returns a fixed report for any location. Gated behind approval, which
/// makes it the standing end-to-end fixture for the approval flow.
pub struct WeatherTool;

#[async_trait]
impl BuiltinTool for WeatherTool {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Get the current weather for a location."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "location": {
                    "type": "string",
                    "description": "City or place name"
                }
            },
            "required": ["location"]
        })
    }

    fn require_approval(&self) -> bool {
        true
    }

    async fn execute(&self, args: &str) -> ToolResult {
        let parsed: Value = match serde_json::from_str(args) {
            Ok(v) => v,
            Err(e) => return ToolResult::error(format!("invalid arguments: {e}")),
        };
        let location = parsed
            .get("location")
            .and_then(|v| v.as_str())
            .unwrap_or("somewhere");

        ToolResult::success(format!(
            "Weather in {location}: 18°C, partly cloudy, light breeze."
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_canned_report_for_location() {
        let out = WeatherTool.execute("{\"location\":\"Paris\"}").await;
        assert!(!out.is_error);
        assert!(out.content.contains("Paris"));
    }
}
