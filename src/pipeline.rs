//! Pipeline driver: the host side of an invocation.
//!
//! The driver describes and binds the environment, then runs the relay's
//! `invoke` entry point inside it. States advance
//! `Idle → EnvironmentReady → ModelInvoked → Classified → Persisted →
//! Dispatched → Done`; the first failure moves to `Failed` and nothing is
//! retried or rolled back.
//!
//! The in-environment process reports its failure kind through its exit
//! code (see [`ErrorKind::exit_code`]), from which the driver recovers how
//! far the invocation got.

use std::fmt;
use std::sync::Arc;

use secrecy::SecretString;
use tracing::{error, info};

use crate::config::{InvocationConfig, RelaySettings};
use crate::env::{self, BuildOptions, ContainerRuntime, DockerRuntime, ServiceHandle, RELAY_BIN};
use crate::error::ErrorKind;
use crate::events::{emit, Event, EventHandler};
use crate::types::ChatMessage;
use crate::RelayError;

/// File the reply is written to inside an export directory.
pub const RESPONSE_FILE: &str = "response.txt";

/// Pipeline states, in order of progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Idle,
    EnvironmentReady,
    ModelInvoked,
    Classified,
    Persisted,
    Dispatched,
    Done,
    Failed,
}

impl PipelineState {
    /// The successor on the success path; `None` for terminal states.
    pub fn next(self) -> Option<PipelineState> {
        use PipelineState::*;
        match self {
            Idle => Some(EnvironmentReady),
            EnvironmentReady => Some(ModelInvoked),
            ModelInvoked => Some(Classified),
            Classified => Some(Persisted),
            Persisted => Some(Dispatched),
            Dispatched => Some(Done),
            Done | Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    /// Last state reached before a failure of `kind`.
    pub fn reached_before(kind: ErrorKind) -> PipelineState {
        match kind {
            ErrorKind::EnvironmentBuild => PipelineState::Idle,
            ErrorKind::Input | ErrorKind::Config | ErrorKind::Provider | ErrorKind::Other => {
                PipelineState::EnvironmentReady
            }
            ErrorKind::UnknownContentType => PipelineState::ModelInvoked,
            ErrorKind::Persistence => PipelineState::Classified,
            ErrorKind::Dispatch => PipelineState::Persisted,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::EnvironmentReady => "environment_ready",
            PipelineState::ModelInvoked => "model_invoked",
            PipelineState::Classified => "classified",
            PipelineState::Persisted => "persisted",
            PipelineState::Dispatched => "dispatched",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A halted pipeline: the error, the last state reached, and whatever
/// artifact existed at that point.
#[derive(Debug, thiserror::Error)]
#[error("pipeline failed after {at}: {error}")]
pub struct PipelineFailure {
    pub at: PipelineState,
    #[source]
    pub error: RelayError,
    /// The model's rendered reply or captured stdout, if any was produced.
    pub artifact: Option<String>,
}

impl PipelineFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Tracks the current state and reports every transition.
pub(crate) struct StateTracker<'a> {
    state: PipelineState,
    handler: &'a Option<Arc<dyn EventHandler>>,
}

impl<'a> StateTracker<'a> {
    pub(crate) fn new(state: PipelineState, handler: &'a Option<Arc<dyn EventHandler>>) -> Self {
        Self { state, handler }
    }

    pub(crate) fn state(&self) -> PipelineState {
        self.state
    }

    /// Move to the next state on the success path.
    pub(crate) fn advance(&mut self) {
        if let Some(to) = self.state.next() {
            info!(from = %self.state, to = %to, "pipeline state");
            emit(self.handler, Event::Transition { from: self.state, to });
            self.state = to;
        }
    }

    /// Advance until `target` is reached.
    pub(crate) fn advance_to(&mut self, target: PipelineState) {
        while self.state != target && !self.state.is_terminal() {
            self.advance();
        }
    }

    /// Halt at the current state.
    pub(crate) fn fail(&mut self, error: RelayError, artifact: Option<String>) -> PipelineFailure {
        let at = self.state;
        error!(state = %at, kind = ?error.kind(), error = %error, "pipeline failed");
        emit(
            self.handler,
            Event::Failed {
                at,
                kind: error.kind(),
                message: error.to_string(),
            },
        );
        emit(self.handler, Event::Transition { from: at, to: PipelineState::Failed });
        self.state = PipelineState::Failed;
        PipelineFailure { at, error, artifact }
    }
}

/// What the caller asks the driver to run.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub messages: Vec<ChatMessage>,
    pub config: InvocationConfig,
    pub build: BuildOptions,
    /// Collaborator service exposed to the environment as `svc`.
    pub service: Option<ServiceHandle>,
    /// Trace-propagation header forwarded into the environment.
    pub trace_header: Option<String>,
}

impl PipelineRequest {
    pub fn new(messages: Vec<ChatMessage>, build: BuildOptions) -> Self {
        Self {
            messages,
            config: InvocationConfig::default(),
            build,
            service: None,
            trace_header: None,
        }
    }

    pub fn with_config(mut self, config: InvocationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_service(mut self, service: ServiceHandle) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_trace_header(mut self, header: Option<String>) -> Self {
        self.trace_header = header;
        self
    }

    /// The `invoke` command line run inside the environment.
    pub fn invoke_argv(&self) -> Result<Vec<String>, RelayError> {
        let mut argv = vec![
            RELAY_BIN.to_string(),
            "invoke".to_string(),
            "--model".to_string(),
            self.config.model.clone(),
            "--max-tokens".to_string(),
            self.config.max_tokens.to_string(),
            "--max-latency-ms".to_string(),
            self.config.deployment.max_latency_ms.to_string(),
        ];
        if let Some(t) = self.config.temperature {
            argv.push("--temperature".to_string());
            argv.push(t.to_string());
        }
        if let Some((target, _)) = &self.build.export_dir {
            argv.push("--out".to_string());
            argv.push(format!("{}/{}", target.trim_end_matches('/'), RESPONSE_FILE));
        }
        argv.push("--".to_string());
        argv.push(serde_json::to_string(&self.messages)?);
        Ok(argv)
    }
}

/// Successful run: the final state and the environment's output.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub state: PipelineState,
    /// The model's reply as printed by the environment.
    pub stdout: String,
    pub stderr: String,
}

/// Host-side pipeline driver.
pub struct Pipeline {
    runtime: Arc<dyn ContainerRuntime>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("runtime", &self.runtime.name())
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Build, bind and run the environment once.
    ///
    /// Returns the captured stdout on success. On failure the error kind is
    /// recovered from the environment's exit code and any stdout captured so
    /// far is kept as the artifact.
    pub async fn run(
        &self,
        credential: SecretString,
        request: &PipelineRequest,
    ) -> Result<PipelineReport, PipelineFailure> {
        let mut tracker = StateTracker::new(PipelineState::Idle, &self.event_handler);

        let prepared = request
            .config
            .validate()
            .and_then(|_| request.invoke_argv())
            .and_then(|argv| env::build(&request.build).map(|e| (e, argv)));
        let (environment, argv) = match prepared {
            Ok(v) => v,
            Err(e) => return Err(tracker.fail(e, None)),
        };

        let mut environment = env::bind(environment, credential, request.service.clone());
        if let Some(header) = &request.trace_header {
            environment = environment.with_env_variable(RelaySettings::TRACE_HEADER_VAR, header.clone());
        }

        // Build steps run inside the container, so readiness is only known
        // once it has exited.
        let output = match environment.run(self.runtime.as_ref(), &argv).await {
            Ok(output) => output,
            Err(e) => return Err(tracker.fail(e, None)),
        };

        match ErrorKind::from_exit_code(output.exit_code) {
            None => {
                tracker.advance_to(PipelineState::Done);
                Ok(PipelineReport {
                    state: tracker.state(),
                    stdout: output.stdout,
                    stderr: output.stderr,
                })
            }
            Some(kind) => {
                tracker.advance_to(PipelineState::reached_before(kind));
                let message = last_line(&output.stderr)
                    .unwrap_or_else(|| format!("environment exited with code {}", output.exit_code));
                let artifact = Some(output.stdout).filter(|s| !s.is_empty());
                Err(tracker.fail(remote_error(kind, message), artifact))
            }
        }
    }
}

/// Builder for [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    runtime: Option<Arc<dyn ContainerRuntime>>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl PipelineBuilder {
    /// Default: [`DockerRuntime`].
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            runtime: self.runtime.unwrap_or_else(|| Arc::new(DockerRuntime)),
            event_handler: self.event_handler,
        }
    }
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// Rebuild an error of `kind` reported by the environment.
fn remote_error(kind: ErrorKind, message: String) -> RelayError {
    match kind {
        ErrorKind::Input => RelayError::InvalidInputFormat(message),
        ErrorKind::EnvironmentBuild => RelayError::EnvironmentBuild(message),
        ErrorKind::Provider => RelayError::Provider { status: None, message },
        ErrorKind::UnknownContentType => RelayError::UnknownContentType(message),
        ErrorKind::Persistence => RelayError::Persistence(message),
        ErrorKind::Dispatch => RelayError::Dispatch { status: None, body: message },
        ErrorKind::Config => RelayError::InvalidConfig(message),
        ErrorKind::Other => RelayError::Other(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::RecordingRuntime;
    use crate::events::EventLog;

    fn request(src: &std::path::Path) -> PipelineRequest {
        PipelineRequest::new(vec![ChatMessage::user("Hello")], BuildOptions::new(src))
    }

    fn secret() -> SecretString {
        SecretString::from("sk-ant-host-secret".to_string())
    }

    #[test]
    fn test_state_progression() {
        let mut state = PipelineState::Idle;
        let mut seen = vec![state];
        while let Some(next) = state.next() {
            state = next;
            seen.push(state);
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(state, PipelineState::Done);
        assert!(PipelineState::Failed.next().is_none());
        assert_eq!(PipelineState::EnvironmentReady.to_string(), "environment_ready");
    }

    #[test]
    fn test_invoke_argv_ends_with_messages() {
        let src = tempfile::tempdir().unwrap();
        let argv = request(src.path()).invoke_argv().unwrap();
        assert_eq!(argv[0], RELAY_BIN);
        assert_eq!(argv[1], "invoke");
        assert_eq!(argv.last().unwrap(), r#"[{"role":"user","content":"Hello"}]"#);
        assert!(argv.contains(&"claude-3-opus-20240229".to_string()));
        assert!(!argv.contains(&"--out".to_string()));

        let out = tempfile::tempdir().unwrap();
        let mut req = request(src.path());
        req.build = req.build.with_export_dir("/export/", out.path());
        let argv = req.invoke_argv().unwrap();
        let idx = argv.iter().position(|a| a == "--out").unwrap();
        assert_eq!(argv[idx + 1], "/export/response.txt");
    }

    #[tokio::test]
    async fn test_success_reaches_done() {
        let src = tempfile::tempdir().unwrap();
        let runtime = Arc::new(RecordingRuntime::succeeding("Hi there"));
        let log = Arc::new(EventLog::new());
        let pipeline = Pipeline::builder()
            .runtime(runtime.clone())
            .event_handler(log.clone())
            .build();

        let report = pipeline
            .run(
                secret(),
                &request(src.path()).with_trace_header(Some("00-abc123-def456-01".into())),
            )
            .await
            .unwrap();
        assert_eq!(report.state, PipelineState::Done);
        assert_eq!(report.stdout, "Hi there");
        assert_eq!(
            log.states(),
            vec![
                PipelineState::EnvironmentReady,
                PipelineState::ModelInvoked,
                PipelineState::Classified,
                PipelineState::Persisted,
                PipelineState::Dispatched,
                PipelineState::Done,
            ]
        );

        let plan = &runtime.plans()[0];
        assert!(plan.args.iter().all(|a| !a.contains("sk-ant-host-secret")));
        assert!(plan.args.contains(&"TRACEPARENT=00-abc123-def456-01".to_string()));
    }

    #[tokio::test]
    async fn test_dispatch_failure_keeps_artifact() {
        let src = tempfile::tempdir().unwrap();
        let runtime = Arc::new(RecordingRuntime::new(crate::env::ExecOutput {
            exit_code: ErrorKind::Dispatch.exit_code(),
            stdout: "Hi there".into(),
            stderr: "INFO stored\nerror: dispatch failed (HTTP 503): down\n".into(),
        }));
        let pipeline = Pipeline::builder().runtime(runtime).build();

        let failure = pipeline.run(secret(), &request(src.path())).await.unwrap_err();
        assert_eq!(failure.at, PipelineState::Persisted);
        assert_eq!(failure.kind(), ErrorKind::Dispatch);
        assert_eq!(failure.artifact.as_deref(), Some("Hi there"));
        assert!(failure.error.to_string().contains("down"));
    }

    #[tokio::test]
    async fn test_unknown_content_fails_after_model_invoked() {
        let src = tempfile::tempdir().unwrap();
        let runtime = Arc::new(RecordingRuntime::exiting(
            ErrorKind::UnknownContentType.exit_code(),
            "error: unknown content type: image",
        ));
        let log = Arc::new(EventLog::new());
        let pipeline = Pipeline::builder()
            .runtime(runtime)
            .event_handler(log.clone())
            .build();

        let failure = pipeline.run(secret(), &request(src.path())).await.unwrap_err();
        assert_eq!(failure.at, PipelineState::ModelInvoked);
        assert!(failure.artifact.is_none());
        assert_eq!(log.states().last(), Some(&PipelineState::Failed));
        assert!(!log.states().contains(&PipelineState::Persisted));
    }

    #[tokio::test]
    async fn test_build_step_failure_is_environment_error() {
        let src = tempfile::tempdir().unwrap();
        let runtime = Arc::new(RecordingRuntime::exiting(
            ErrorKind::EnvironmentBuild.exit_code(),
            "error: could not compile",
        ));
        let log = Arc::new(EventLog::new());
        let pipeline = Pipeline::builder()
            .runtime(runtime)
            .event_handler(log.clone())
            .build();

        let failure = pipeline.run(secret(), &request(src.path())).await.unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::EnvironmentBuild);
        assert_eq!(failure.at, PipelineState::Idle);
        assert_eq!(log.states(), vec![PipelineState::Failed]);
    }

    #[tokio::test]
    async fn test_init_db_failure_reports_environment_not_persistence() {
        let src = tempfile::tempdir().unwrap();
        let runtime = Arc::new(RecordingRuntime::exiting(
            ErrorKind::EnvironmentBuild.exit_code(),
            "error: schema: disk I/O error",
        ));
        let log = Arc::new(EventLog::new());
        let pipeline = Pipeline::builder()
            .runtime(runtime.clone())
            .event_handler(log.clone())
            .build();

        let failure = pipeline.run(secret(), &request(src.path())).await.unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::EnvironmentBuild);
        assert!(matches!(failure.error, RelayError::EnvironmentBuild(ref m) if m.contains("disk I/O")));
        assert!(!log.states().contains(&PipelineState::ModelInvoked));
        assert!(!log.states().contains(&PipelineState::Classified));

        let script = runtime.plans()[0]
            .args
            .iter()
            .find(|a| a.contains("init-db"))
            .cloned()
            .unwrap();
        assert!(script.contains("init-db || exit 16"));
    }

    #[tokio::test]
    async fn test_unrecognized_exit_code_is_environment_error() {
        let src = tempfile::tempdir().unwrap();
        let runtime = Arc::new(RecordingRuntime::exiting(101, "error: could not compile"));
        let pipeline = Pipeline::builder().runtime(runtime).build();

        let failure = pipeline.run(secret(), &request(src.path())).await.unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::EnvironmentBuild);
        assert_eq!(failure.at, PipelineState::Idle);
    }

    struct UnboundRuntime;

    #[async_trait::async_trait]
    impl ContainerRuntime for UnboundRuntime {
        async fn run(&self, _plan: &crate::env::RunPlan) -> crate::Result<crate::env::ExecOutput> {
            Err(RelayError::EnvironmentBuild(
                "cannot bind api as `svc` on network relay-net: No such network".into(),
            ))
        }

        fn name(&self) -> &'static str {
            "unbound"
        }
    }

    #[tokio::test]
    async fn test_binding_failure_stops_before_model_call() {
        let src = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLog::new());
        let pipeline = Pipeline::builder()
            .runtime(Arc::new(UnboundRuntime))
            .event_handler(log.clone())
            .build();

        let failure = pipeline
            .run(
                secret(),
                &request(src.path()).with_service(ServiceHandle::new("relay-net", "api")),
            )
            .await
            .unwrap_err();
        assert_eq!(failure.at, PipelineState::Idle);
        assert_eq!(failure.kind(), ErrorKind::EnvironmentBuild);
        assert_eq!(log.states(), vec![PipelineState::Failed]);
    }

    #[tokio::test]
    async fn test_missing_source_fails_in_idle_without_running() {
        let runtime = Arc::new(RecordingRuntime::succeeding(""));
        let pipeline = Pipeline::builder().runtime(runtime.clone()).build();

        let failure = pipeline
            .run(secret(), &request(std::path::Path::new("/no/such/dir")))
            .await
            .unwrap_err();
        assert_eq!(failure.at, PipelineState::Idle);
        assert_eq!(failure.kind(), ErrorKind::EnvironmentBuild);
        assert!(runtime.plans().is_empty());
    }
}
