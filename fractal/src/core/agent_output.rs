//! Parsing of the agent's JSON output stream.
//!
//! The agent writes one JSON object per line (or a single object for plain
//! `--output-format json`). Lines that are not JSON objects are ignored.

use serde_json::Value;

use crate::core::metrics::TokenUsage;

/// What could be recovered from an attempt's log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOutput {
    /// Sum over every line carrying usage.
    pub usage: TokenUsage,
    /// `result` text of the last result event.
    pub result: Option<String>,
    /// `is_error` of the last result event.
    pub is_error: Option<bool>,
}

pub fn parse_agent_output(text: &str) -> AgentOutput {
    let mut output = AgentOutput::default();
    for line in text.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(Value::Object(event)) = serde_json::from_str::<Value>(line) else {
            continue;
        };

        if let Some(usage) = event.get("usage").and_then(Value::as_object) {
            output.usage += TokenUsage {
                input_tokens: count(usage.get("input_tokens")),
                output_tokens: count(usage.get("output_tokens")),
                cache_read_tokens: count(usage.get("cache_read_input_tokens")),
                cache_creation_tokens: count(usage.get("cache_creation_input_tokens")),
            };
        } else if let Some(models) = event.get("modelUsage").and_then(Value::as_object) {
            for model in models.values() {
                output.usage += TokenUsage {
                    input_tokens: count(model.get("inputTokens")),
                    output_tokens: count(model.get("outputTokens")),
                    cache_read_tokens: count(model.get("cacheReadInputTokens")),
                    cache_creation_tokens: count(model.get("cacheCreationInputTokens")),
                };
            }
        }

        let is_result = event.get("type").and_then(Value::as_str) == Some("result");
        if is_result || event.contains_key("is_error") {
            if let Some(flag) = event.get("is_error").and_then(Value::as_bool) {
                output.is_error = Some(flag);
            }
            if let Some(text) = event.get("result").and_then(Value::as_str) {
                output.result = Some(text.to_string());
            }
        }
    }
    output
}

fn count(value: Option<&Value>) -> u64 {
    value.and_then(Value::as_u64).unwrap_or(0)
}
