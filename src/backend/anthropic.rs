//! Backend for the Anthropic Messages API.
//!
//! Endpoint: `POST {base}/v1/messages`, authenticated with `x-api-key`.

use super::{Backend, InvocationRequest, InvocationResult};
use crate::error::Result;
use crate::RelayError;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

/// `anthropic-version` header value.
pub const API_VERSION: &str = "2023-06-01";

/// Backend for the Anthropic Messages API.
///
/// # Example
///
/// ```
/// use llm_relay::backend::AnthropicBackend;
///
/// let backend = AnthropicBackend::new("sk-ant-...");
/// ```
#[derive(Clone)]
pub struct AnthropicBackend {
    api_key: SecretString,
}

impl std::fmt::Debug for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let key = self.api_key.expose_secret();
        let masked = match key.char_indices().nth(6) {
            Some((idx, _)) => format!("{}***", &key[..idx]),
            None => "***".to_string(),
        };
        f.debug_struct("AnthropicBackend")
            .field("api_key", &masked)
            .finish()
    }
}

impl AnthropicBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::from(api_key.into()),
        }
    }

    pub fn from_secret(api_key: SecretString) -> Self {
        Self { api_key }
    }

    /// Build the reqwest request with the auth and version headers.
    fn build_http_request(
        &self,
        client: &Client,
        url: &str,
        request: &InvocationRequest,
    ) -> reqwest::RequestBuilder {
        client
            .post(url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(request)
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &InvocationRequest,
    ) -> Result<InvocationResult> {
        let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));
        debug!(
            model = %request.model,
            messages = %serde_json::to_string(&request.messages).unwrap_or_default(),
            "sending request with messages"
        );

        let resp = self
            .build_http_request(client, &url, request)
            .send()
            .await
            .map_err(|e| RelayError::Provider {
                status: None,
                message: if e.is_timeout() {
                    format!("request to {url} timed out: {e}")
                } else if e.is_connect() {
                    format!("failed to connect to {url}: {e}")
                } else {
                    format!("request to {url} failed: {e}")
                },
            })?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "provider returned an error status");
            return Err(RelayError::Provider {
                status: Some(status.as_u16()),
                message: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| RelayError::Provider {
            status: Some(status.as_u16()),
            message: format!("malformed provider response: {e}"),
        })
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}
