//! Wire-visible text markers: ClaudeMem traffic detection and the
//! `<CCR-SUBAGENT-*>` routing overrides embedded in `system[1].text`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::context::SubagentMarkers;

/// Literal fragments that identify ClaudeMem / Memory-Agent traffic.
/// Matched case-insensitively against message and system text.
const CLAUDE_MEM_LITERALS: [&str; 6] = [
    "you are a claude-mem",
    "hello memory agent",
    "memory processing continued",
    "claude-mem://",
    "primary session",
    "session_summary",
];

static CLAUDE_MEM_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?is)memory agent.*observation").expect("memory agent pattern"),
        Regex::new(r"(?is)you do not have access to tools.*create observations")
            .expect("no-tools pattern"),
    ]
});

static ROUTER_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<CCR-SUBAGENT-ROUTER>(.*?)</CCR-SUBAGENT-ROUTER>").expect("router marker")
});

static MODEL_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<CCR-SUBAGENT-MODEL>(.*?)</CCR-SUBAGENT-MODEL>").expect("model marker")
});

fn text_matches_claude_mem(text: &str) -> bool {
    let lower = text.to_lowercase();
    CLAUDE_MEM_LITERALS.iter().any(|lit| lower.contains(lit))
        || CLAUDE_MEM_PATTERNS.iter().any(|re| re.is_match(text))
}

/// Scan every `messages[*].content` text and every `system[*].text` for the
/// ClaudeMem pattern set. Such requests must never carry client OAuth
/// upstream.
pub fn is_claude_mem_request(body: &Value) -> bool {
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for message in messages {
            match message.get("content") {
                Some(Value::String(text)) => {
                    if text_matches_claude_mem(text) {
                        return true;
                    }
                }
                Some(Value::Array(blocks)) => {
                    for block in blocks {
                        if let Some(text) = block.get("text").and_then(Value::as_str)
                            && text_matches_claude_mem(text)
                        {
                            return true;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    if let Some(system) = body.get("system").and_then(Value::as_array) {
        for block in system {
            if let Some(text) = block.get("text").and_then(Value::as_str)
                && text_matches_claude_mem(text)
            {
                return true;
            }
        }
    }

    false
}

/// Pull both subagent markers out of a text block. Captured names are NOT
/// trimmed: a name with stray whitespace will simply fail the config lookup
/// downstream.
pub fn extract_markers(text: &str) -> SubagentMarkers {
    SubagentMarkers {
        router_name: ROUTER_MARKER
            .captures(text)
            .map(|c| c[1].to_string())
            .filter(|s| !s.is_empty()),
        model_name: MODEL_MARKER
            .captures(text)
            .map(|c| c[1].to_string())
            .filter(|s| !s.is_empty()),
    }
}

/// `system[1].text` is the only position markers are honored in.
pub fn markers_from_body(body: &Value) -> SubagentMarkers {
    body.get("system")
        .and_then(Value::as_array)
        .and_then(|system| system.get(1))
        .and_then(|block| block.get("text"))
        .and_then(Value::as_str)
        .map(extract_markers)
        .unwrap_or_default()
}

pub fn strip_router_marker(text: &str) -> String {
    ROUTER_MARKER.replace_all(text, "").into_owned()
}

pub fn strip_model_marker(text: &str) -> String {
    MODEL_MARKER.replace_all(text, "").into_owned()
}
