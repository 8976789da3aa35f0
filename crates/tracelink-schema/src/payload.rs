//! Payload sanitizing for structured `data` fields.

use serde_json::Value;

/// Maximum nesting depth preserved in event payloads.
pub const MAX_PAYLOAD_DEPTH: usize = 32;

/// Sentinel inserted where payload structure is cut off.
pub const CIRCULAR_SENTINEL: &str = "[Circular]";

/// Deep-copy `value`, replacing anything nested deeper than
/// [`MAX_PAYLOAD_DEPTH`] with the [`CIRCULAR_SENTINEL`] string.
///
/// `serde_json::Value` trees cannot alias, so unbounded depth is the only
/// way a self-referential source structure can surface here. The sentinel
/// is part of the wire contract and observable to consumers.
pub fn sanitize_payload(value: &Value) -> Value {
    sanitize_at(value, 0)
}

fn sanitize_at(value: &Value, depth: usize) -> Value {
    if depth >= MAX_PAYLOAD_DEPTH {
        return Value::String(CIRCULAR_SENTINEL.to_string());
    }
    match value {
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| sanitize_at(v, depth + 1)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_at(v, depth + 1)))
                .collect(),
        ),
        other => other.clone(),
    }
}
