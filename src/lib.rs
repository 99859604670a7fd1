//! # LLM Relay
//!
//! Send one prompt to a hosted LLM inside a disposable container, record the
//! exchange in SQLite and forward a normalized event downstream.
//!
//! The crate has two halves:
//!
//! - the **host side**: [`env`] describes an isolated environment (base
//!   image, read-only source, dependency cache, optional history directory,
//!   secret credential, service binding) and [`Pipeline`] runs it once;
//! - the **environment side**: the `invoke` entry point builds the message
//!   list with [`loader`], then [`invocation::run`] drives one model call
//!   through [`backend`], classifies the reply with
//!   [`content`], appends it to the [`store`] and posts a
//!   [`ConversationEvent`](types::ConversationEvent) through [`dispatch`].
//!
//! ## Core Concepts
//!
//! - **[`ExecCtx`]** -- everything one invocation needs: HTTP client, model
//!   backend, store, dispatcher, validated config, trace id.
//! - **[`Backend`](backend::Backend)** -- the model provider seam;
//!   [`AnthropicBackend`] for real calls, [`MockBackend`] for tests.
//! - **[`ContentBlock`]** -- the closed `Text | ToolUse` set a reply is
//!   classified into. Anything else fails the invocation before persistence.
//! - **[`PipelineState`]** -- `Idle → EnvironmentReady → ModelInvoked →
//!   Classified → Persisted → Dispatched → Done`, or `Failed`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use llm_relay::{invocation, ExecCtx, MockBackend};
//! use llm_relay::store::ConversationStore;
//! use llm_relay::types::ChatMessage;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = ConversationStore::new("conversations.db");
//!     store.init_schema()?;
//!
//!     let ctx = ExecCtx::builder("https://api.anthropic.com")
//!         .backend(Arc::new(MockBackend::text("Hi there")))
//!         .store(store)
//!         .dispatch_url("http://localhost:8080/api/v1")
//!         .build()?;
//!
//!     let outcome = invocation::run(&ctx, vec![ChatMessage::user("Hello")]).await?;
//!     println!("{}", outcome.output);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod content;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod events;
pub mod exec_ctx;
pub mod invocation;
pub mod loader;
pub mod logging;
pub mod pipeline;
pub mod store;
pub mod trace;
pub mod types;

pub use backend::{AnthropicBackend, MockBackend};
pub use config::{InvocationConfig, RelaySettings};
pub use content::ContentBlock;
pub use error::{ErrorKind, RelayError, Result};
pub use exec_ctx::{ExecCtx, ExecCtxBuilder};
pub use pipeline::{Pipeline, PipelineFailure, PipelineState};
