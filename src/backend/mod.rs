//! Backend trait and normalized request/response types.
//!
//! The [`Backend`] trait abstracts over the model provider, translating a
//! normalized [`InvocationRequest`] into one HTTP call and the reply into an
//! [`InvocationResult`]. Built-in implementations: [`AnthropicBackend`] and
//! [`MockBackend`].
//!
//! ## Architecture
//!
//! ```text
//! Invocation ──► InvocationRequest ──► Backend::complete() ──► InvocationResult
//!                                            │
//!                                 ┌──────────┴──────────┐
//!                          AnthropicBackend         MockBackend
//!                          POST /v1/messages        canned replies
//! ```
//!
//! One synchronous request per invocation: no streaming and no retry. A
//! failed call is fatal for the invocation.

pub mod anthropic;
pub mod mock;

pub use anthropic::AnthropicBackend;
pub use mock::MockBackend;

use crate::config::InvocationConfig;
use crate::error::Result;
use crate::types::{null_as_default, ChatMessage, Usage};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A normalized model request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationRequest {
    /// Model identifier (e.g. `"claude-3-opus-20240229"`).
    pub model: String,

    /// Maximum tokens to generate.
    pub max_tokens: u32,

    /// Sampling temperature; left out of the body when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Conversation so far, in order.
    pub messages: Vec<ChatMessage>,
}

impl InvocationRequest {
    pub fn new(messages: Vec<ChatMessage>, config: &InvocationConfig) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            messages,
        }
    }
}

/// What the provider returned for one call.
///
/// `content` holds the raw blocks; classification happens afterwards so a
/// reply with an unexpected block still reaches the classifier intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    /// Provider-assigned message id.
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub role: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub usage: Usage,
    pub content: Vec<Value>,
}

/// Abstraction over model providers.
///
/// This trait is object-safe and designed to be used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute one non-streaming call.
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &InvocationRequest,
    ) -> Result<InvocationResult>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}
