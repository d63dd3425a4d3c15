use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

/// Wall clock in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// JS-style truthiness, used where the wire contract says "field present
/// and truthy" (e.g. `body.thinking`).
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Parse JSON leniently: strict first, then JSON5 (trailing commas,
/// unquoted keys). Streamed tool arguments are assembled from deltas and
/// models occasionally emit such fragments.
pub fn lenient_json(input: &str) -> Result<Value, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    json5::from_str(trimmed).map_err(|e| e.to_string())
}
