//! Content blocks and the response classifier.
//!
//! The provider returns a list of loosely-typed blocks. [`classify`] maps each
//! onto the closed [`ContentBlock`] set and refuses anything else, and
//! [`classify_all`] is all-or-nothing: one unknown block fails the whole reply.
//!
//! The canonical JSON text of a block has its object keys sorted at every
//! level, so equal blocks always serialize to identical bytes.

use crate::{error::Result, RelayError};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// One unit of a model reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    /// Plain text.
    Text { text: String },
    /// A structured tool invocation. `payload` is every field of the block
    /// except `type` (typically `id`, `name`, `input`).
    ToolUse { payload: Map<String, Value> },
}

impl ContentBlock {
    pub fn type_name(&self) -> &'static str {
        match self {
            ContentBlock::Text { .. } => "text",
            ContentBlock::ToolUse { .. } => "tool_use",
        }
    }

    /// The block as a JSON value, with its `type` tag.
    pub fn to_value(&self) -> Value {
        match self {
            ContentBlock::Text { text } => {
                let mut obj = Map::new();
                obj.insert("type".into(), Value::String("text".into()));
                obj.insert("text".into(), Value::String(text.clone()));
                Value::Object(obj)
            }
            ContentBlock::ToolUse { payload } => {
                let mut obj = payload.clone();
                obj.insert("type".into(), Value::String("tool_use".into()));
                Value::Object(obj)
            }
        }
    }

    /// Canonical JSON text of the block.
    pub fn to_canonical_json(&self) -> String {
        canonicalize(self.to_value()).to_string()
    }

    /// What gets persisted for this block alone: raw text for text blocks,
    /// canonical JSON for tool-use blocks.
    pub fn render(&self) -> String {
        match self {
            ContentBlock::Text { text } => text.clone(),
            ContentBlock::ToolUse { .. } => self.to_canonical_json(),
        }
    }
}

impl Serialize for ContentBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// Map one raw provider block onto a [`ContentBlock`].
pub fn classify(block: &Value) -> Result<ContentBlock> {
    let obj = block.as_object().ok_or_else(|| {
        RelayError::UnknownContentType(format!("block is not an object: {}", snippet(block)))
    })?;

    match obj.get("type").and_then(Value::as_str) {
        Some("text") => {
            let text = obj.get("text").and_then(Value::as_str).ok_or_else(|| {
                RelayError::UnknownContentType(format!(
                    "text block without a string `text`: {}",
                    snippet(block)
                ))
            })?;
            Ok(ContentBlock::Text {
                text: text.to_string(),
            })
        }
        Some("tool_use") => {
            let mut payload = obj.clone();
            payload.remove("type");
            Ok(ContentBlock::ToolUse { payload })
        }
        Some(other) => Err(RelayError::UnknownContentType(other.to_string())),
        None => Err(RelayError::UnknownContentType(format!(
            "block without a type: {}",
            snippet(block)
        ))),
    }
}

/// Classify every block, failing on the first unrecognised one.
pub fn classify_all(blocks: &[Value]) -> Result<Vec<ContentBlock>> {
    blocks.iter().map(classify).collect()
}

/// The persisted form of a whole reply.
///
/// A single block persists as [`ContentBlock::render`]; several blocks
/// persist as the canonical JSON list of all of them; an empty reply as `""`.
pub fn render_output(blocks: &[ContentBlock]) -> String {
    match blocks {
        [] => String::new(),
        [only] => only.render(),
        many => canonicalize(Value::Array(many.iter().map(ContentBlock::to_value).collect()))
            .to_string(),
    }
}

/// Rebuild every object with its keys in sorted order.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut entries: Vec<(String, Value)> = obj.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

fn snippet(value: &Value) -> String {
    let text = value.to_string();
    match text.char_indices().nth(120) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_text() {
        let block = classify(&json!({"type": "text", "text": "Hi there"})).unwrap();
        assert_eq!(
            block,
            ContentBlock::Text {
                text: "Hi there".into()
            }
        );
        assert_eq!(block.render(), "Hi there");
        assert_eq!(block.to_canonical_json(), r#"{"text":"Hi there","type":"text"}"#);
    }

    #[test]
    fn test_classify_tool_use_keeps_payload() {
        let raw = json!({"type": "tool_use", "name": "lookup", "input": {"q": "x"}});
        let block = classify(&raw).unwrap();
        assert_eq!(block.type_name(), "tool_use");
        assert_eq!(block.to_value(), raw);
        assert_eq!(
            block.render(),
            r#"{"input":{"q":"x"},"name":"lookup","type":"tool_use"}"#
        );
        assert_eq!(serde_json::to_value(&block).unwrap(), raw);
    }

    #[test]
    fn test_canonical_json_ignores_field_order() {
        let a = classify(&json!({"type": "tool_use", "name": "n", "id": "t1"})).unwrap();
        let b = classify(&json!({"id": "t1", "name": "n", "type": "tool_use"})).unwrap();
        assert_eq!(a.to_canonical_json(), b.to_canonical_json());
    }

    #[test]
    fn test_unknown_types_are_rejected() {
        for raw in [
            json!({"type": "image", "source": {}}),
            json!({"text": "no type"}),
            json!("bare string"),
            json!({"type": "text"}),
        ] {
            assert!(matches!(
                classify(&raw),
                Err(RelayError::UnknownContentType(_))
            ));
        }
    }

    #[test]
    fn test_classify_all_is_all_or_nothing() {
        let blocks = vec![
            json!({"type": "text", "text": "ok"}),
            json!({"type": "thinking", "thinking": "..."}),
        ];
        match classify_all(&blocks) {
            Err(RelayError::UnknownContentType(t)) => assert_eq!(t, "thinking"),
            other => panic!("expected UnknownContentType, got {other:?}"),
        }
    }

    #[test]
    fn test_render_output_shapes() {
        assert_eq!(render_output(&[]), "");

        let text = ContentBlock::Text { text: "Hi".into() };
        assert_eq!(render_output(std::slice::from_ref(&text)), "Hi");

        let tool = classify(&json!({"type": "tool_use", "name": "lookup"})).unwrap();
        let both = render_output(&[text, tool]);
        let parsed: Value = serde_json::from_str(&both).unwrap();
        assert_eq!(
            parsed,
            json!([{"type": "text", "text": "Hi"}, {"type": "tool_use", "name": "lookup"}])
        );
    }
}
