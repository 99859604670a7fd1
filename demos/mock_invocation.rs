//! Runs one invocation against a mock model and prints every state change.
//!
//! The dispatcher points at an address nothing listens on, so the run stops
//! after persisting: the row stays and the reply is still returned as the
//! failure artifact.
//!
//! ```sh
//! cargo run --example mock_invocation
//! ```

use std::sync::Arc;

use llm_relay::events::{Event, FnEventHandler};
use llm_relay::store::ConversationStore;
use llm_relay::types::ChatMessage;
use llm_relay::{invocation, ExecCtx, MockBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    llm_relay::logging::init("warn", false);

    let dir = std::env::temp_dir().join("llm-relay-demo");
    let store = ConversationStore::new(dir.join("conversations.db"));
    store.init_schema()?;

    let handler = Arc::new(FnEventHandler(|event: Event| match event {
        Event::Transition { from, to } => println!("  {from} -> {to}"),
        Event::Persisted { id } => println!("  stored row {id}"),
        Event::Dispatched { status } => println!("  downstream answered {status}"),
        Event::Failed { at, kind, message } => println!("  failed at {at} ({kind:?}): {message}"),
    }));

    let ctx = ExecCtx::builder("https://api.anthropic.com")
        .backend(Arc::new(MockBackend::text("Hi there")))
        .store(store.clone())
        .dispatch_url("http://127.0.0.1:9/api/v1")
        .event_handler(handler)
        .build()?;

    match invocation::run(&ctx, vec![ChatMessage::user("Hello")]).await {
        Ok(outcome) => println!("reply: {}", outcome.output),
        Err(failure) => println!(
            "reply kept despite failure: {}",
            failure.artifact.as_deref().unwrap_or("<none>")
        ),
    }

    println!("rows in {}: {}", store.path().display(), store.count()?);
    Ok(())
}
