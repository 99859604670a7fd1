use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// The role of a chat message author.
///
/// Roles outside the well-known three are carried through verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    #[default]
    User,
    /// Assistant (model) response.
    Assistant,
    /// Any other role string.
    #[serde(untagged)]
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Other(s) => s,
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        match s {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => Role::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single outbound message, carried as the JSON value it was loaded as.
///
/// Messages read from a list are never reshaped: unknown fields, block-list
/// content and key order all reach the provider and the store untouched.
/// Order in a list is conversation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatMessage(Value);

impl ChatMessage {
    /// A `{"role", "content"}` message with plain-text content.
    pub fn new(role: impl Into<Role>, content: impl Into<String>) -> Self {
        let role: Role = role.into();
        let mut obj = Map::new();
        obj.insert("role".into(), Value::String(role.as_str().to_string()));
        obj.insert("content".into(), Value::String(content.into()));
        Self(Value::Object(obj))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// The role field, when the message has a string one.
    pub fn role(&self) -> Option<Role> {
        self.0.get("role").and_then(Value::as_str).map(Role::from)
    }

    pub fn content(&self) -> Option<&Value> {
        self.0.get("content")
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for ChatMessage {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Token counters reported by the provider, passed through verbatim.
///
/// A missing or `null` counter reads as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub input_tokens: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub output_tokens: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub cache_read_input_tokens: u64,
}

/// Deserialize `null` the same way as a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The normalized record forwarded to the downstream service.
///
/// Only ever built from a fully classified invocation, so `response` holds
/// one serialized block per block the provider returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvent {
    /// Provider-assigned message id.
    pub session_id: String,
    /// Outbound messages, as sent.
    pub messages: Vec<ChatMessage>,
    /// Serialized content blocks, in provider order.
    pub response: Vec<Value>,
    pub model: String,
    pub stop_reason: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub cache_read_input_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Correlation id from the trace-propagation header, if one was present.
    pub trace_id: Option<String>,
}

/// One persisted row of the `conversation` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: i64,
    /// Raw JSON text of the outbound messages.
    pub input: String,
    /// Raw text or canonical JSON of the model's reply.
    pub output: String,
}
