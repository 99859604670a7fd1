//! Mock backend for testing without a live provider.
//!
//! [`MockBackend`] returns pre-configured replies in order, allowing
//! deterministic tests of everything downstream of the model call.
//!
//! # Example
//!
//! ```
//! use llm_relay::backend::MockBackend;
//!
//! let mock = MockBackend::text("Hello, world!");
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{Backend, InvocationRequest, InvocationResult};
use crate::error::Result;
use crate::types::Usage;
use crate::RelayError;

/// One canned reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Ok(InvocationResult),
    /// Fails the call as a provider error with this status and message.
    Fail { status: Option<u16>, message: String },
}

/// A test backend that returns canned replies in order.
///
/// Cycles back to the beginning when all replies have been consumed.
/// Every request is recorded and can be inspected with [`MockBackend::requests`].
#[derive(Debug)]
pub struct MockBackend {
    replies: Vec<MockReply>,
    index: AtomicUsize,
    requests: Mutex<Vec<InvocationRequest>>,
}

impl MockBackend {
    /// Create a mock backend with the given canned replies.
    pub fn new(replies: Vec<MockReply>) -> Self {
        assert!(!replies.is_empty(), "MockBackend requires at least one reply");
        Self {
            replies,
            index: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A mock that always answers with the given raw content blocks.
    pub fn blocks(content: Vec<Value>) -> Self {
        Self::new(vec![MockReply::Ok(Self::result(content))])
    }

    /// A mock that always answers with one text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::blocks(vec![json!({"type": "text", "text": text.into()})])
    }

    /// A mock whose every call fails as a transport error.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(vec![MockReply::Fail {
            status: None,
            message: message.into(),
        }])
    }

    /// A plausible provider result around the given content.
    pub fn result(content: Vec<Value>) -> InvocationResult {
        InvocationResult {
            id: "msg_mock".to_string(),
            model: "mock-model".to_string(),
            stop_reason: Some("end_turn".to_string()),
            kind: "message".to_string(),
            role: "assistant".to_string(),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                cache_read_input_tokens: 0,
            },
            content,
        }
    }

    /// Number of calls made so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<InvocationRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next_reply(&self) -> MockReply {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.replies.len();
        self.replies[idx].clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn complete(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &InvocationRequest,
    ) -> Result<InvocationResult> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request.clone());
        }
        match self.next_reply() {
            MockReply::Ok(result) => Ok(result),
            MockReply::Fail { status, message } => Err(RelayError::Provider { status, message }),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InvocationConfig;
    use crate::types::ChatMessage;

    fn request() -> InvocationRequest {
        InvocationRequest::new(vec![ChatMessage::user("test")], &InvocationConfig::default())
    }

    #[tokio::test]
    async fn test_mock_text_reply() {
        let mock = MockBackend::text("Hello!");
        let resp = mock
            .complete(&Client::new(), "http://unused", &request())
            .await
            .unwrap();
        assert_eq!(resp.content, vec![json!({"type": "text", "text": "Hello!"})]);
        assert_eq!(mock.calls(), 1);
        assert_eq!(mock.requests()[0].messages[0].content(), Some(&json!("test")));
    }

    #[tokio::test]
    async fn test_mock_cycles_replies() {
        let mock = MockBackend::new(vec![
            MockReply::Ok(MockBackend::result(vec![json!({"type": "text", "text": "first"})])),
            MockReply::Fail {
                status: Some(500),
                message: "second".into(),
            },
        ]);
        let client = Client::new();
        let r1 = mock.complete(&client, "http://unused", &request()).await;
        let r2 = mock.complete(&client, "http://unused", &request()).await;
        let r3 = mock.complete(&client, "http://unused", &request()).await;
        assert!(r1.is_ok());
        assert!(matches!(r2, Err(RelayError::Provider { status: Some(500), .. })));
        assert!(r3.is_ok()); // cycles
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_failing() {
        let mock = MockBackend::failing("connection reset");
        let err = mock
            .complete(&Client::new(), "http://unused", &request())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "provider error: connection reset");
    }
}
