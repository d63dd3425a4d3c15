//! Request-size estimation with a fixed cl100k BPE.
//!
//! The resolver only consumes the grand total, so precision beyond
//! same-encoding-everywhere is not needed.

use serde_json::Value;
use tiktoken_rs::CoreBPE;

fn bpe() -> &'static CoreBPE {
    tiktoken_rs::cl100k_base_singleton()
}

fn count_text(text: &str) -> u64 {
    bpe().encode_with_special_tokens(text).len() as u64
}

fn count_json(value: &Value) -> u64 {
    serde_json::to_string(value).map_or(0, |s| count_text(&s))
}

fn count_content_block(block: &Value) -> u64 {
    match block.get("type").and_then(Value::as_str) {
        Some("tool_use") => block.get("input").map_or(0, count_json),
        Some("tool_result") => match block.get("content") {
            Some(Value::String(s)) => count_text(s),
            Some(other) => count_json(other),
            None => 0,
        },
        _ => block
            .get("text")
            .and_then(Value::as_str)
            .map_or(0, count_text),
    }
}

/// Estimate the token footprint of `(messages, system, tools)`.
pub fn estimate_tokens(messages: &Value, system: &Value, tools: &Value) -> u64 {
    let mut total = 0;

    if let Some(messages) = messages.as_array() {
        for message in messages {
            match message.get("content") {
                Some(Value::String(text)) => total += count_text(text),
                Some(Value::Array(blocks)) => {
                    total += blocks.iter().map(count_content_block).sum::<u64>();
                }
                _ => {}
            }
        }
    }

    if let Some(system) = system.as_array() {
        for block in system {
            if let Some(text) = block.get("text").and_then(Value::as_str) {
                total += count_text(text);
            }
        }
    }

    if let Some(tools) = tools.as_array() {
        for tool in tools {
            if let Some(name) = tool.get("name").and_then(Value::as_str) {
                total += count_text(name);
            }
            if let Some(description) = tool.get("description").and_then(Value::as_str) {
                total += count_text(description);
            }
            if let Some(schema) = tool.get("input_schema") {
                total += count_json(schema);
            }
        }
    }

    total
}

/// Convenience over a full request body.
pub fn estimate_body_tokens(body: &Value) -> u64 {
    let null = Value::Null;
    estimate_tokens(
        body.get("messages").unwrap_or(&null),
        body.get("system").unwrap_or(&null),
        body.get("tools").unwrap_or(&null),
    )
}
