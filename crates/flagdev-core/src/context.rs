use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// Key of the context used when none is supplied.
pub const DEFAULT_CONTEXT_KEY: &str = "dev-environment";

/// An SDK evaluation context, kept as the JSON object the SDKs send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Context(Map<String, Value>);

impl Context {
    /// Parse and validate a context from JSON.
    ///
    /// A context is an object with a non-empty string `key`, or a
    /// multi-kind context (`"kind": "multi"`).
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let Value::Object(map) = value else {
            return Err(ValidationError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        };

        let is_multi = map.get("kind").and_then(Value::as_str) == Some("multi");
        let has_key = map
            .get("key")
            .and_then(Value::as_str)
            .is_some_and(|k| !k.is_empty());

        if !is_multi && !has_key {
            return Err(ValidationError::InvalidContext(
                "context must have a non-empty key".to_string(),
            ));
        }

        Ok(Self(map))
    }

    /// Parse a context sent as JSON bytes (REPORT request bodies).
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ValidationError::InvalidContext(e.to_string()))?;
        Self::from_value(value)
    }

    /// Parse a context sent base64-encoded in a URL path segment.
    pub fn from_base64(encoded: &str) -> Result<Self, ValidationError> {
        let bytes = decode_base64(encoded).ok_or_else(|| {
            ValidationError::InvalidContext("context is not valid base64".to_string())
        })?;
        Self::from_json_bytes(&bytes)
    }

    /// The context's key, if it is a single-kind context.
    pub fn key(&self) -> Option<&str> {
        self.0.get("key").and_then(Value::as_str)
    }

    /// The context's kind. Contexts without a kind are legacy users.
    pub fn kind(&self) -> &str {
        self.0.get("kind").and_then(Value::as_str).unwrap_or("user")
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl Default for Context {
    fn default() -> Self {
        let mut map = Map::new();
        map.insert("kind".to_string(), Value::from("user"));
        map.insert("key".to_string(), Value::from(DEFAULT_CONTEXT_KEY));
        Self(map)
    }
}

impl TryFrom<Value> for Context {
    type Error = ValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Context> for Value {
    fn from(context: Context) -> Self {
        Value::Object(context.0)
    }
}

/// Decode base64 as sent by SDKs: URL-safe with or without padding, falling
/// back to the standard alphabet.
pub fn decode_base64(encoded: &str) -> Option<Vec<u8>> {
    let trimmed = encoded.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(encoded))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_context() {
        let context = Context::default();
        assert_eq!(context.kind(), "user");
        assert_eq!(context.key(), Some(DEFAULT_CONTEXT_KEY));
    }

    #[test]
    fn test_from_base64_url_safe() {
        let raw = r#"{"kind":"user","key":"alice","name":"Alice?"}"#;
        let encoded = URL_SAFE_NO_PAD.encode(raw);

        let context = Context::from_base64(&encoded).unwrap();
        assert_eq!(context.key(), Some("alice"));
    }

    #[test]
    fn test_from_base64_standard_padded() {
        let raw = r#"{"key":"bob"}"#;
        let encoded = STANDARD.encode(raw);

        let context = Context::from_base64(&encoded).unwrap();
        assert_eq!(context.key(), Some("bob"));
        assert_eq!(context.kind(), "user");
    }

    #[test]
    fn test_multi_kind_without_key() {
        let context = Context::from_value(json!({
            "kind": "multi",
            "user": {"key": "u1"},
            "org": {"key": "o1"}
        }))
        .unwrap();
        assert_eq!(context.kind(), "multi");
        assert_eq!(context.key(), None);
    }

    #[test]
    fn test_rejects_invalid_contexts() {
        assert!(Context::from_value(json!("alice")).is_err());
        assert!(Context::from_value(json!({"kind": "user"})).is_err());
        assert!(Context::from_value(json!({"key": ""})).is_err());
        assert!(Context::from_base64("%%%").is_err());
        assert!(Context::from_json_bytes(b"not json").is_err());
    }

    #[test]
    fn test_serde_validates() {
        let parsed: Result<Context, _> = serde_json::from_str(r#"{"name":"nokey"}"#);
        assert!(parsed.is_err());

        let context: Context = serde_json::from_str(r#"{"key":"k"}"#).unwrap();
        assert_eq!(serde_json::to_string(&context).unwrap(), r#"{"key":"k"}"#);
    }
}
