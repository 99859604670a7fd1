//! The in-environment stage sequence for one invocation.
//!
//! invoke → classify → persist → dispatch, strictly in that order. A
//! provider failure or an unrecognized content block stops the run before
//! anything is written; a dispatch failure leaves the stored row in place.

use crate::backend::InvocationRequest;
use crate::content::{classify_all, render_output, ContentBlock};
use crate::dispatch::DispatchOutcome;
use crate::events::{emit, Event};
use crate::exec_ctx::ExecCtx;
use crate::pipeline::{PipelineFailure, PipelineState, StateTracker};
use crate::types::{ChatMessage, ConversationEvent};
use crate::RelayError;
use std::time::Instant;
use tracing::{info, warn};

/// Everything a successful invocation produced.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    /// Id of the appended `conversation` row.
    pub record_id: i64,
    /// The persisted output text, also the process artifact.
    pub output: String,
    pub blocks: Vec<ContentBlock>,
    pub event: ConversationEvent,
    pub dispatch: DispatchOutcome,
}

/// Run one invocation with an already-loaded message list.
///
/// Starts in [`PipelineState::EnvironmentReady`] and ends in
/// [`PipelineState::Done`]. The store schema must already exist.
pub async fn run(
    ctx: &ExecCtx,
    messages: Vec<ChatMessage>,
) -> Result<InvocationOutcome, PipelineFailure> {
    let mut tracker = StateTracker::new(PipelineState::EnvironmentReady, &ctx.event_handler);
    let request = InvocationRequest::new(messages, &ctx.config);

    let started = Instant::now();
    let result = match ctx.backend.complete(&ctx.client, &ctx.base_url, &request).await {
        Ok(result) => result,
        Err(e) => return Err(tracker.fail(e, None)),
    };
    let elapsed = started.elapsed();
    if elapsed > ctx.config.latency_target() {
        warn!(
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            target_ms = ctx.config.deployment.max_latency_ms,
            "model call exceeded latency target"
        );
    }
    info!(
        id = %result.id,
        model = %result.model,
        blocks = result.content.len(),
        input_tokens = result.usage.input_tokens,
        output_tokens = result.usage.output_tokens,
        "model replied"
    );
    tracker.advance();

    let blocks = match classify_all(&result.content) {
        Ok(blocks) => blocks,
        Err(e) => return Err(tracker.fail(e, None)),
    };
    tracker.advance();

    let output = render_output(&blocks);
    let input = match serde_json::to_string(&request.messages) {
        Ok(input) => input,
        Err(e) => return Err(tracker.fail(e.into(), Some(output))),
    };

    let store = ctx.store.clone();
    let row = (input, output.clone());
    let appended = tokio::task::spawn_blocking(move || store.append(&row.0, &row.1))
        .await
        .map_err(|e| RelayError::Persistence(format!("store task: {e}")))
        .and_then(|r| r);
    let record_id = match appended {
        Ok(id) => id,
        Err(e) => return Err(tracker.fail(e, Some(output))),
    };
    emit(&ctx.event_handler, Event::Persisted { id: record_id });
    tracker.advance();

    let event = ConversationEvent {
        session_id: result.id,
        messages: request.messages,
        response: blocks.iter().map(ContentBlock::to_value).collect(),
        model: result.model,
        stop_reason: result.stop_reason.unwrap_or_default(),
        kind: result.kind,
        role: result.role,
        cache_read_input_tokens: result.usage.cache_read_input_tokens,
        input_tokens: result.usage.input_tokens,
        output_tokens: result.usage.output_tokens,
        trace_id: ctx.trace_id.clone(),
    };

    let dispatch = match ctx.dispatcher.send(&event).await {
        Ok(outcome) => outcome,
        Err(e) => return Err(tracker.fail(e, Some(output))),
    };
    emit(&ctx.event_handler, Event::Dispatched { status: dispatch.status });
    tracker.advance_to(PipelineState::Done);

    Ok(InvocationOutcome {
        record_id,
        output,
        blocks,
        event,
        dispatch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::events::EventLog;
    use crate::store::ConversationStore;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn harness(
        backend: MockBackend,
        dispatch_status: u16,
    ) -> (tempfile::TempDir, MockServer, Arc<EventLog>, ExecCtx) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path().join("conversations.db"));
        store.init_schema().unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(dispatch_status).set_body_string("ack"))
            .mount(&server)
            .await;

        let log = Arc::new(EventLog::new());
        let ctx = ExecCtx::builder("http://provider.invalid")
            .backend(Arc::new(backend))
            .store(store)
            .dispatch_url(format!("{}/api/v1", server.uri()))
            .event_handler(log.clone())
            .build()
            .unwrap();
        (dir, server, log, ctx)
    }

    #[tokio::test]
    async fn test_happy_path_walks_every_state() {
        let (_dir, _server, log, ctx) = harness(MockBackend::text("Hi there"), 200).await;
        let outcome = run(&ctx, vec![ChatMessage::user("Hello")]).await.unwrap();

        assert_eq!(outcome.output, "Hi there");
        assert_eq!(outcome.dispatch.status, 200);
        assert_eq!(outcome.event.session_id, "msg_mock");
        assert_eq!(outcome.event.stop_reason, "end_turn");
        assert_eq!(outcome.event.response, vec![json!({"type": "text", "text": "Hi there"})]);
        assert_eq!(
            log.states(),
            vec![
                PipelineState::ModelInvoked,
                PipelineState::Classified,
                PipelineState::Persisted,
                PipelineState::Dispatched,
                PipelineState::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_dispatch_failure_keeps_row() {
        let (_dir, _server, _log, ctx) = harness(MockBackend::text("Hi there"), 503).await;
        let failure = run(&ctx, vec![ChatMessage::user("Hello")]).await.unwrap_err();

        assert_eq!(failure.at, PipelineState::Persisted);
        assert!(matches!(failure.error, RelayError::Dispatch { status: Some(503), .. }));
        assert_eq!(failure.artifact.as_deref(), Some("Hi there"));
        assert_eq!(ctx.store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_schema_is_persistence_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ExecCtx::builder("http://provider.invalid")
            .backend(Arc::new(MockBackend::text("Hi there")))
            .store(ConversationStore::new(dir.path().join("no-schema.db")))
            .dispatch_url("http://127.0.0.1:9/api/v1")
            .build()
            .unwrap();

        let failure = run(&ctx, vec![ChatMessage::user("Hello")]).await.unwrap_err();
        assert_eq!(failure.at, PipelineState::Classified);
        assert!(matches!(failure.error, RelayError::Persistence(_)));
        assert_eq!(failure.artifact.as_deref(), Some("Hi there"));
    }

    #[tokio::test]
    async fn test_mixed_unknown_block_writes_nothing() {
        let backend = MockBackend::blocks(vec![
            json!({"type": "text", "text": "partial"}),
            json!({"type": "image", "source": {}}),
        ]);
        let (_dir, server, _log, ctx) = harness(backend, 200).await;
        let failure = run(&ctx, vec![ChatMessage::user("Hello")]).await.unwrap_err();

        assert_eq!(failure.at, PipelineState::ModelInvoked);
        assert!(matches!(failure.error, RelayError::UnknownContentType(_)));
        assert_eq!(ctx.store.count().unwrap(), 0);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_carries_config() {
        let backend = Arc::new(MockBackend::text("ok"));
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path().join("c.db"));
        store.init_schema().unwrap();
        let ctx = ExecCtx::builder("http://provider.invalid")
            .backend(backend.clone())
            .store(store)
            .dispatch_url("http://127.0.0.1:9/api/v1")
            .config(
                crate::config::InvocationConfig::default()
                    .with_model("claude-3-haiku-20240307")
                    .with_max_tokens(64)
                    .with_temperature(None),
            )
            .build()
            .unwrap();

        let _ = run(&ctx, vec![ChatMessage::user("Hello")]).await;
        let sent = &backend.requests()[0];
        assert_eq!(sent.model, "claude-3-haiku-20240307");
        assert_eq!(sent.max_tokens, 64);
        assert_eq!(sent.temperature, None);
    }
}
