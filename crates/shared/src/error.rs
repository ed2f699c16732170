use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error body the backend attaches to non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

impl ErrorBody {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Pulls the human-readable detail out of an already-parsed error body,
/// tolerating bodies that are not the canonical `{"detail": ...}` shape.
pub fn detail_from_body(body: &Value) -> Option<&str> {
    match body {
        Value::Object(map) => map.get("detail").and_then(Value::as_str),
        Value::String(text) => Some(text.as_str()),
        _ => None,
    }
}
