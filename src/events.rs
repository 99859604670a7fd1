//! Event hooks for pipeline state transitions.
//!
//! Provides an optional, non-intrusive way to observe an invocation.
//! The driver and the in-environment stages emit an event on every state
//! change and on the first failure. Implement [`EventHandler`] to receive
//! them for progress reporting or test assertions.

use std::sync::Arc;

use crate::error::ErrorKind;
use crate::pipeline::PipelineState;

/// Events emitted while an invocation progresses.
#[derive(Debug, Clone)]
pub enum Event {
    /// The pipeline entered a new state.
    Transition {
        from: PipelineState,
        to: PipelineState,
    },
    /// A row was appended to the conversation store.
    Persisted {
        id: i64,
    },
    /// The downstream service answered.
    Dispatched {
        status: u16,
    },
    /// The pipeline halted. `at` is the last state reached before the failure.
    Failed {
        at: PipelineState,
        kind: ErrorKind,
        message: String,
    },
}

/// Handler for pipeline events.
///
/// This is entirely optional -- the pipeline works without an event handler.
///
/// # Example
///
/// ```
/// use llm_relay::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         match event {
///             Event::Transition { to, .. } => eprintln!("[state] {to}"),
///             Event::Failed { at, message, .. } => eprintln!("[failed at {at}] {message}"),
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use llm_relay::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     if let Event::Persisted { id } = event {
///         eprintln!("stored row {id}");
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}

/// Collects every event it receives. Handy in tests.
#[derive(Debug, Default)]
pub struct EventLog {
    events: std::sync::Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Target states of every transition, in order.
    pub fn states(&self) -> Vec<PipelineState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Transition { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }
}

impl EventHandler for EventLog {
    fn on_event(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_handler_is_noop() {
        emit(&None, Event::Persisted { id: 1 });
    }

    #[test]
    fn test_event_log_records_states() {
        let log = Arc::new(EventLog::new());
        let handler: Option<Arc<dyn EventHandler>> = Some(log.clone());
        emit(
            &handler,
            Event::Transition {
                from: PipelineState::Idle,
                to: PipelineState::EnvironmentReady,
            },
        );
        emit(&handler, Event::Dispatched { status: 200 });
        assert_eq!(log.states(), vec![PipelineState::EnvironmentReady]);
        assert_eq!(log.events().len(), 2);
    }

    #[test]
    fn test_fn_handler_receives_events() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = FnEventHandler(move |e: Event| {
            if let Event::Failed { kind, .. } = e {
                sink.lock().unwrap().push(kind);
            }
        });
        handler.on_event(Event::Failed {
            at: PipelineState::ModelInvoked,
            kind: ErrorKind::UnknownContentType,
            message: "image".into(),
        });
        assert_eq!(*seen.lock().unwrap(), vec![ErrorKind::UnknownContentType]);
    }
}
