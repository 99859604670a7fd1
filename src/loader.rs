//! Input loading: turn a prompt or a message file into the outbound message list.

use crate::{
    error::Result,
    types::{ChatMessage, Role},
    RelayError,
};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

/// Build the outbound message list from a prompt or a JSON file.
///
/// A prompt wins over a file when both are given. A prompt becomes a single
/// message with `role`. A file must contain a JSON list; its elements are
/// taken as messages exactly as written.
pub fn load(prompt: Option<&str>, file: Option<&Path>, role: Role) -> Result<Vec<ChatMessage>> {
    if let Some(prompt) = prompt {
        return Ok(vec![ChatMessage::new(role, prompt)]);
    }

    let path = file.ok_or(RelayError::MissingInput)?;
    let text = std::fs::read_to_string(path).map_err(|e| {
        RelayError::InvalidInputFormat(format!("cannot read {}: {e}", path.display()))
    })?;
    debug!(path = %path.display(), bytes = text.len(), "loaded message file");
    parse_message_list(&text)
}

/// Parse JSON text that must be a list. Elements are not inspected.
pub fn parse_message_list(text: &str) -> Result<Vec<ChatMessage>> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RelayError::InvalidInputFormat(format!("not valid JSON: {e}")))?;

    match value {
        Value::Array(items) => Ok(items.into_iter().map(ChatMessage::from).collect()),
        other => Err(RelayError::InvalidInputFormat(format!(
            "expected a JSON list of messages, got {}",
            json_type_name(&other)
        ))),
    }
}

/// Interpret the process entry argument: a JSON message list, or a raw prompt.
///
/// Anything that does not parse as a JSON list is sent as the prompt text.
pub fn from_argument(arg: &str, role: Role) -> Result<Vec<ChatMessage>> {
    if arg.trim().is_empty() {
        return Err(RelayError::MissingInput);
    }
    match parse_message_list(arg) {
        Ok(messages) => Ok(messages),
        Err(e) => {
            debug!(reason = %e, "entry argument is not a message list; using it as a prompt");
            Ok(vec![ChatMessage::new(role, arg)])
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
