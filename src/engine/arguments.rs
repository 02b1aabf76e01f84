//! Tool-call argument decoding.
//!
//! Backends disagree on how arguments travel: a JSON-encoded string (the
//! OpenAI convention), a bare object, or nothing at all. Anything that does
//! not decode to an object becomes an empty map so the round can proceed and
//! the tool server can report what it is missing.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ArgumentParseError {
    #[error("arguments are not valid JSON: {reason}")]
    InvalidJson { reason: String },

    #[error("arguments decode to {found}, expected an object")]
    NotAnObject { found: &'static str },
}

/// Decode a raw arguments payload into an object.
pub fn parse_arguments(payload: &Value) -> Result<Map<String, Value>, ArgumentParseError> {
    match payload {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Map::new()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(ArgumentParseError::NotAnObject {
                found: kind(&other),
            }),
            Err(e) => Err(ArgumentParseError::InvalidJson {
                reason: e.to_string(),
            }),
        },
        other => Err(ArgumentParseError::NotAnObject { found: kind(other) }),
    }
}

/// Decode, falling back to an empty map with a warning.
pub fn recover_arguments(call_id: &str, tool_name: &str, payload: &Value) -> Map<String, Value> {
    parse_arguments(payload).unwrap_or_else(|e| {
        tracing::warn!(
            call_id,
            tool = tool_name,
            error = %e,
            "unparseable tool arguments, dispatching with empty arguments"
        );
        Map::new()
    })
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_used_as_is() {
        let map = parse_arguments(&json!({"path": "/a"})).unwrap();
        assert_eq!(map["path"], "/a");
    }

    #[test]
    fn test_json_string_decoded() {
        let map = parse_arguments(&json!("{\"a\": 1, \"b\": [2]}")).unwrap();
        assert_eq!(map["a"], 1);
        assert_eq!(map["b"][0], 2);
    }

    #[test]
    fn test_missing_arguments_are_empty() {
        assert!(parse_arguments(&Value::Null).unwrap().is_empty());
        assert!(parse_arguments(&json!("")).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_string_is_error() {
        assert!(matches!(
            parse_arguments(&json!("{not valid json")),
            Err(ArgumentParseError::InvalidJson { .. })
        ));
    }

    #[test]
    fn test_non_object_is_error() {
        assert_eq!(
            parse_arguments(&json!("[1, 2]")),
            Err(ArgumentParseError::NotAnObject { found: "an array" })
        );
        assert_eq!(
            parse_arguments(&json!(42)),
            Err(ArgumentParseError::NotAnObject { found: "a number" })
        );
    }

    #[test]
    fn test_recover_returns_empty_map() {
        assert!(recover_arguments("c1", "files__read", &json!("{not valid json")).is_empty());
        assert_eq!(
            recover_arguments("c1", "files__read", &json!({"k": "v"}))["k"],
            "v"
        );
    }
}
