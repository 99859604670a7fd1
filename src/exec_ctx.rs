//! Execution context for one in-environment invocation.
//!
//! [`ExecCtx`] carries the HTTP client, model backend, endpoint, store,
//! dispatcher, validated configuration, trace id and optional event handler.
//! It is constructed once per process and passed by reference to
//! [`invocation::run`](crate::invocation::run); there is no global client.

use crate::backend::{AnthropicBackend, Backend};
use crate::config::{InvocationConfig, RelaySettings, DEFAULT_DB_PATH};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::events::EventHandler;
use crate::store::ConversationStore;
use crate::trace::extract_trace_id;
use crate::RelayError;
use reqwest::Client;
use secrecy::SecretString;
use std::sync::Arc;

/// Shared execution context for an invocation.
///
/// # Example
///
/// ```
/// use llm_relay::{ExecCtx, MockBackend};
/// use std::sync::Arc;
///
/// let ctx = ExecCtx::builder("https://api.anthropic.com")
///     .backend(Arc::new(MockBackend::text("Hi there")))
///     .trace_id(Some("abc123".to_string()))
///     .build()
///     .unwrap();
/// assert_eq!(ctx.trace_id.as_deref(), Some("abc123"));
/// ```
pub struct ExecCtx {
    /// HTTP client (cheap to clone -- uses `Arc` internally).
    pub client: Client,
    /// Provider base URL without the API path.
    pub base_url: String,
    pub backend: Arc<dyn Backend>,
    pub store: ConversationStore,
    pub dispatcher: Dispatcher,
    pub config: InvocationConfig,
    /// Correlation id carried into the dispatched event.
    pub trace_id: Option<String>,
    pub event_handler: Option<Arc<dyn EventHandler>>,
}

impl ExecCtx {
    pub fn builder(base_url: impl Into<String>) -> ExecCtxBuilder {
        ExecCtxBuilder {
            client: None,
            base_url: base_url.into(),
            backend: None,
            store: None,
            dispatch_url: None,
            config: InvocationConfig::default(),
            trace_id: None,
            event_handler: None,
        }
    }

    /// Context for the Anthropic backend, wired from process settings.
    ///
    /// Fails with a config error when the credential is missing.
    pub fn from_settings(settings: &RelaySettings, config: InvocationConfig) -> Result<Self> {
        let api_key = settings.require_api_key()?;
        Self::builder(settings.base_url.clone())
            .api_key(api_key)
            .store(ConversationStore::new(&settings.db_path))
            .dispatch_url(settings.dispatch_url.clone())
            .trace_id(settings.trace_header.as_deref().and_then(extract_trace_id))
            .config(config)
            .build()
    }
}

impl std::fmt::Debug for ExecCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecCtx")
            .field("base_url", &self.base_url)
            .field("backend", &self.backend.name())
            .field("store", &self.store.path())
            .field("dispatch", &self.dispatcher.endpoint())
            .field("model", &self.config.model)
            .field("trace_id", &self.trace_id)
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

/// Builder for [`ExecCtx`].
pub struct ExecCtxBuilder {
    client: Option<Client>,
    base_url: String,
    backend: Option<Arc<dyn Backend>>,
    store: Option<ConversationStore>,
    dispatch_url: Option<String>,
    config: InvocationConfig,
    trace_id: Option<String>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl ExecCtxBuilder {
    /// Set the HTTP client. If not set, a default client without an overall timeout is used.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use the Anthropic backend with this credential.
    pub fn api_key(mut self, api_key: SecretString) -> Self {
        self.backend = Some(Arc::new(AnthropicBackend::from_secret(api_key)));
        self
    }

    /// Default: `conversations.db` in the working directory.
    pub fn store(mut self, store: ConversationStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Default: the `svc` sidecar endpoint.
    pub fn dispatch_url(mut self, url: impl Into<String>) -> Self {
        self.dispatch_url = Some(url.into());
        self
    }

    pub fn config(mut self, config: InvocationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Validate the configuration and build the context.
    pub fn build(self) -> Result<ExecCtx> {
        self.config.validate()?;
        let backend = self
            .backend
            .ok_or_else(|| RelayError::InvalidConfig("no model backend configured".into()))?;
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .build()
                .map_err(|e| RelayError::InvalidConfig(format!("HTTP client: {e}")))?,
        };
        let dispatcher = match self.dispatch_url {
            Some(url) => Dispatcher::new(client.clone(), url),
            None => Dispatcher::sidecar(client.clone()),
        };
        Ok(ExecCtx {
            client,
            base_url: normalize_base_url(&self.base_url),
            backend,
            store: self
                .store
                .unwrap_or_else(|| ConversationStore::new(DEFAULT_DB_PATH)),
            dispatcher,
            config: self.config,
            trace_id: self.trace_id,
            event_handler: self.event_handler,
        })
    }
}

/// Strip the Messages API path from a base URL so the backend can append it once.
/// e.g., "https://api.anthropic.com/v1" -> "https://api.anthropic.com"
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    // Longest first.
    for suffix in &["/v1/messages", "/v1"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}
