//! Typed coercion for upstream JSON whose shape drifts between calls.
//!
//! The ATS sometimes returns a scalar, sometimes a one-element list, and
//! sometimes a `{ "data": [...] }` wrapper for the same field. Everything
//! downstream of the mapper sees plain text or flags.

use serde_json::{Map as JsonMap, Value as JsonValue};

/// First non-empty text in `value`. Lists yield their first usable element.
pub fn first_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Array(items) => items.iter().find_map(first_text),
        JsonValue::Object(_) | JsonValue::Null => None,
    }
}

/// Interpret booleans, `"true"`/`"false"`/`"yes"`/`"no"` and 0/1.
pub fn as_flag(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => n.as_i64().map(|v| v != 0),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        JsonValue::Array(items) => items.iter().find_map(as_flag),
        JsonValue::Object(_) | JsonValue::Null => None,
    }
}

/// Unwrap an object, the first object of a list, or the first object of a
/// `{ "data": [...] }` wrapper.
pub fn first_object(value: &JsonValue) -> Option<&JsonMap<String, JsonValue>> {
    match value {
        JsonValue::Object(map) => match map.get("data") {
            Some(inner @ JsonValue::Array(_)) => first_object(inner),
            _ => Some(map),
        },
        JsonValue::Array(items) => items.iter().find_map(first_object),
        _ => None,
    }
}

/// Integer view of a value, accepting numeric strings.
pub fn as_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Array(items) => items.iter().find_map(as_i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lists_yield_first_non_empty_element() {
        assert_eq!(first_text(&json!(["", "  ", "ON"])).as_deref(), Some("ON"));
        assert_eq!(first_text(&json!([])), None);
        assert_eq!(first_text(&json!(null)), None);
        assert_eq!(first_text(&json!(42)).as_deref(), Some("42"));
    }

    #[test]
    fn flags_accept_loose_encodings() {
        assert_eq!(as_flag(&json!("FALSE")), Some(false));
        assert_eq!(as_flag(&json!(1)), Some(true));
        assert_eq!(as_flag(&json!("maybe")), None);
    }

    #[test]
    fn data_wrapper_is_unwrapped() {
        let value = json!({"total": 1, "data": [{"firstName": "Ada"}]});
        let obj = first_object(&value).unwrap();
        assert_eq!(obj["firstName"], "Ada");
    }
}
