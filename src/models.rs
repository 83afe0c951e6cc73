//! Core data models for the memory filter

use crate::error::FilterError;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

//
// ================= Roles =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//
// ================= Chat Message =================
//

/// A message the filter itself adds to an envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

//
// ================= Request Envelope =================
//

/// Inbound/outbound chat payload.
///
/// Only the `messages` array is inspected or mutated; every other field is
/// carried through untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    body: Map<String, Value>,
}

impl RequestEnvelope {
    /// Parse a request body. Accepts a JSON object or a string holding one.
    pub fn parse(body: &Value) -> Result<Self> {
        let object = match body {
            Value::Object(map) => map.clone(),
            Value::String(raw) => match serde_json::from_str::<Value>(raw)? {
                Value::Object(map) => map,
                other => {
                    return Err(FilterError::MalformedInput(format!(
                        "expected a JSON object, got {}",
                        json_kind(&other)
                    )))
                }
            },
            other => {
                return Err(FilterError::MalformedInput(format!(
                    "expected a JSON object, got {}",
                    json_kind(other)
                )))
            }
        };

        match object.get("messages") {
            Some(Value::Array(_)) => Ok(Self { body: object }),
            Some(other) => Err(FilterError::MalformedInput(format!(
                "`messages` must be an array, got {}",
                json_kind(other)
            ))),
            None => Err(FilterError::MalformedInput(
                "missing `messages` key".to_string(),
            )),
        }
    }

    fn messages(&self) -> &[Value] {
        self.body
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn message_count(&self) -> usize {
        self.messages().len()
    }

    /// Text of the last `user` message, or an empty string when there is none.
    ///
    /// Content may be a plain string or a list of parts; for the latter the
    /// first `text` part is used.
    pub fn latest_user_message(&self) -> String {
        self.messages()
            .iter()
            .rev()
            .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            .and_then(|m| m.get("content"))
            .map(content_text)
            .unwrap_or_default()
    }

    /// Insert a message at the head of `messages`.
    pub fn prepend(&mut self, message: ChatMessage) -> Result<()> {
        let entry = serde_json::to_value(message)?;
        if let Some(Value::Array(messages)) = self.body.get_mut("messages") {
            messages.insert(0, entry);
        }
        Ok(())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .find(|p| p.get("type").and_then(Value::as_str) == Some("text"))
            .and_then(|p| p.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_latest_user_message() {
        let body = json!({
            "model": "llama3",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": "second"},
                {"role": "assistant", "content": "another reply"}
            ]
        });
        let envelope = RequestEnvelope::parse(&body).unwrap();
        assert_eq!(envelope.latest_user_message(), "second");
    }

    #[test]
    fn test_latest_user_message_from_parts() {
        let body = json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "image_url", "image_url": {"url": "data:..."}},
                    {"type": "text", "text": "what is in this picture?"}
                ]
            }]
        });
        let envelope = RequestEnvelope::parse(&body).unwrap();
        assert_eq!(envelope.latest_user_message(), "what is in this picture?");
    }

    #[test]
    fn test_no_user_message_is_empty() {
        let body = json!({"messages": [{"role": "system", "content": "be nice"}]});
        let envelope = RequestEnvelope::parse(&body).unwrap();
        assert_eq!(envelope.latest_user_message(), "");
    }

    #[test]
    fn test_string_body_is_parsed() {
        let body = Value::String(r#"{"messages": [{"role": "user", "content": "hi"}]}"#.into());
        let envelope = RequestEnvelope::parse(&body).unwrap();
        assert_eq!(envelope.latest_user_message(), "hi");
    }

    #[test]
    fn test_malformed_bodies() {
        assert!(matches!(
            RequestEnvelope::parse(&json!([1, 2, 3])),
            Err(FilterError::MalformedInput(_))
        ));
        assert!(matches!(
            RequestEnvelope::parse(&json!({"model": "x"})),
            Err(FilterError::MalformedInput(_))
        ));
        assert!(matches!(
            RequestEnvelope::parse(&json!({"messages": "nope"})),
            Err(FilterError::MalformedInput(_))
        ));
        assert!(RequestEnvelope::parse(&Value::String("not json".into())).is_err());
    }

    #[test]
    fn test_prepend_keeps_other_fields() {
        let body = json!({
            "model": "gpt-4o",
            "stream": true,
            "messages": [{"role": "user", "content": "hello"}]
        });
        let mut envelope = RequestEnvelope::parse(&body).unwrap();
        envelope.prepend(ChatMessage::system("remember")).unwrap();

        let out = envelope.into_value();
        assert_eq!(out["model"], "gpt-4o");
        assert_eq!(out["stream"], true);
        assert_eq!(out["messages"][0], json!({"role": "system", "content": "remember"}));
        assert_eq!(out["messages"][1]["content"], "hello");
    }
}
