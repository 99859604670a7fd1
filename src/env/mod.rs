//! Isolated execution environment: description, build and secret binding.
//!
//! An [`Environment`] is an immutable description of a container: base
//! image, mounts, variables, secrets, service bindings and build steps.
//! Every `with_*` call returns a new description; nothing touches the host
//! until [`Environment::run`], which hands a rendered [`RunPlan`] to a
//! [`ContainerRuntime`].
//!
//! ```text
//! build(options) ──► bind(env, credential, service) ──► env.run(runtime, argv)
//!   image, /src (ro)        ANTHROPIC_API_KEY (secret)      docker run --rm ...
//!   cache volume            svc alias on a network          sh -c 'step || exit 16; exec "$@"'
//!   /history, installs
//!   init-db (last step)
//! ```

pub mod runtime;

pub use runtime::{ContainerRuntime, DockerRuntime, ExecOutput, RecordingRuntime, RunPlan};

use crate::{
    config::RelaySettings,
    error::{ErrorKind, Result},
    RelayError,
};
use secrecy::SecretString;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default base image.
pub const DEFAULT_IMAGE: &str = "rust:1.83-slim";
/// Default dependency cache key.
pub const DEFAULT_CACHE_KEY: &str = "cargo";
/// Where the caller's source tree is mounted.
pub const SOURCE_PATH: &str = "/src";
/// Package manager cache location inside the image.
pub const CACHE_PATH: &str = "/usr/local/cargo/registry";
/// Where the optional history directory is mounted.
pub const HISTORY_PATH: &str = "/history";
/// Install root of the relay binary inside the environment.
pub const INSTALL_ROOT: &str = "/opt/llm-relay";
/// The relay binary inside the environment.
pub const RELAY_BIN: &str = "/opt/llm-relay/bin/llm-relay";
/// Store location when no history directory is mounted; lost with the container.
pub const EPHEMERAL_DB_PATH: &str = "/var/lib/llm-relay/conversations.db";
/// System packages the relay needs to build.
pub const SYSTEM_PACKAGES: &[&str] = &["pkg-config", "libssl-dev"];
/// Hostname under which a bound service is reachable.
pub const SERVICE_ALIAS: &str = "svc";

/// A host directory mounted into the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// A named cache shared across invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMount {
    pub key: String,
    pub target: String,
}

impl CacheMount {
    /// Name of the backing volume; the same key always maps to the same volume.
    pub fn volume_name(&self) -> String {
        let key: String = self
            .key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        format!("llm-relay-cache-{key}")
    }
}

/// A running collaborator service, addressed by container name on a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub network: String,
    pub container: String,
}

impl ServiceHandle {
    pub fn new(network: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            container: container.into(),
        }
    }
}

/// A service exposed to the environment under `alias`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBinding {
    pub alias: String,
    pub service: ServiceHandle,
}

/// Immutable description of an execution environment.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    image: String,
    workdir: Option<String>,
    directories: Vec<DirectoryMount>,
    caches: Vec<CacheMount>,
    variables: BTreeMap<String, String>,
    secrets: Vec<(String, SecretString)>,
    services: Vec<ServiceBinding>,
    steps: Vec<Vec<String>>,
}

impl Environment {
    /// Start from a base image.
    pub fn from_image(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn with_workdir(mut self, path: impl Into<String>) -> Self {
        self.workdir = Some(path.into());
        self
    }

    /// Mount a host directory at `target`.
    pub fn with_directory(
        mut self,
        target: impl Into<String>,
        source: impl Into<PathBuf>,
        read_only: bool,
    ) -> Self {
        self.directories.push(DirectoryMount {
            source: source.into(),
            target: target.into(),
            read_only,
        });
        self
    }

    /// Writable mount whose contents outlive the container.
    pub fn with_export(self, target: impl Into<String>, host_dir: impl Into<PathBuf>) -> Self {
        self.with_directory(target, host_dir, false)
    }

    /// Mount the named cache `key` at `target`.
    pub fn with_cache(mut self, target: impl Into<String>, key: impl Into<String>) -> Self {
        self.caches.push(CacheMount {
            key: key.into(),
            target: target.into(),
        });
        self
    }

    pub fn with_env_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Expose `secret` as variable `name`, visible only to the running process.
    pub fn with_secret_variable(mut self, name: impl Into<String>, secret: SecretString) -> Self {
        let name = name.into();
        self.secrets.retain(|(n, _)| *n != name);
        self.secrets.push((name, secret));
        self
    }

    pub fn with_service_binding(mut self, alias: impl Into<String>, service: ServiceHandle) -> Self {
        self.services.push(ServiceBinding {
            alias: alias.into(),
            service,
        });
        self
    }

    /// Append a build step. Steps run in order before the final command and
    /// any failing step aborts the run.
    pub fn with_exec<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps.push(argv.into_iter().map(Into::into).collect());
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn directories(&self) -> &[DirectoryMount] {
        &self.directories
    }

    pub fn caches(&self) -> &[CacheMount] {
        &self.caches
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn secret_names(&self) -> impl Iterator<Item = &str> {
        self.secrets.iter().map(|(n, _)| n.as_str())
    }

    pub fn services(&self) -> &[ServiceBinding] {
        &self.services
    }

    pub fn steps(&self) -> &[Vec<String>] {
        &self.steps
    }

    /// Render the description plus a final command into a runnable plan.
    pub fn plan<S: AsRef<str>>(&self, argv: &[S]) -> Result<RunPlan> {
        if self.image.trim().is_empty() {
            return Err(RelayError::EnvironmentBuild("no base image".into()));
        }
        if argv.is_empty() {
            return Err(RelayError::EnvironmentBuild("no command to run".into()));
        }

        let networks: Vec<&str> = {
            let mut n: Vec<&str> = self.services.iter().map(|s| s.service.network.as_str()).collect();
            n.sort_unstable();
            n.dedup();
            n
        };
        if networks.len() > 1 {
            return Err(RelayError::EnvironmentBuild(format!(
                "service bindings span several networks: {}",
                networks.join(", ")
            )));
        }

        let mut args: Vec<String> = vec!["run".into(), "--rm".into()];
        if let Some(network) = networks.first() {
            args.push("--network".into());
            args.push((*network).to_string());
        }
        for dir in &self.directories {
            let mut spec = format!(
                "type=bind,source={},target={}",
                dir.source.display(),
                dir.target
            );
            if dir.read_only {
                spec.push_str(",readonly");
            }
            args.push("--mount".into());
            args.push(spec);
        }
        for cache in &self.caches {
            args.push("--mount".into());
            args.push(format!(
                "type=volume,source={},target={}",
                cache.volume_name(),
                cache.target
            ));
        }
        for (name, value) in &self.variables {
            args.push("-e".into());
            args.push(format!("{name}={value}"));
        }
        // Name only: docker reads the value from its own environment.
        for (name, _) in &self.secrets {
            args.push("-e".into());
            args.push(name.clone());
        }
        if let Some(workdir) = &self.workdir {
            args.push("-w".into());
            args.push(workdir.clone());
        }
        args.push(self.image.clone());
        args.push("sh".into());
        args.push("-c".into());
        args.push(self.script()?);
        args.push("sh".into());
        args.extend(argv.iter().map(|a| a.as_ref().to_string()));

        Ok(RunPlan {
            program: "docker".into(),
            args,
            secrets: self.secrets.clone(),
            services: self.services.clone(),
        })
    }

    /// Every build step, then `exec "$@"` for the final command.
    ///
    /// A failing step exits with the environment-build code, so it can never
    /// be mistaken for a failure of the final command.
    fn script(&self) -> Result<String> {
        let build_failed = ErrorKind::EnvironmentBuild.exit_code();
        let mut lines = Vec::with_capacity(self.steps.len() + 1);
        for step in &self.steps {
            let line = shlex::try_join(step.iter().map(String::as_str)).map_err(|e| {
                RelayError::EnvironmentBuild(format!("cannot quote step {step:?}: {e}"))
            })?;
            lines.push(format!("{line} || exit {build_failed}"));
        }
        lines.push("exec \"$@\"".to_string());
        Ok(lines.join("\n"))
    }

    /// Run the final command `argv` in a fresh container built from this description.
    pub async fn run<S: AsRef<str>>(
        &self,
        runtime: &dyn ContainerRuntime,
        argv: &[S],
    ) -> Result<ExecOutput> {
        let plan = self.plan(argv)?;
        info!(
            image = %self.image,
            steps = self.steps.len(),
            runtime = runtime.name(),
            "running environment"
        );
        let output = runtime.run(&plan).await?;
        debug!(exit_code = output.exit_code, "environment exited");
        Ok(output)
    }
}

/// Inputs to [`build`].
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// The caller's source tree (this crate), mounted read-only.
    pub source_dir: PathBuf,
    pub image: String,
    pub cache_key: String,
    /// Optional host directory that keeps the conversation store across runs.
    pub history_dir: Option<PathBuf>,
    /// Optional host directory for exported artifacts, mounted writable.
    pub export_dir: Option<(String, PathBuf)>,
}

impl BuildOptions {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            image: DEFAULT_IMAGE.to_string(),
            cache_key: DEFAULT_CACHE_KEY.to_string(),
            history_dir: None,
            export_dir: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = key.into();
        self
    }

    pub fn with_history_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.history_dir = Some(dir.into());
        self
    }

    /// Mount host `dir` writable at `target` so files written there outlive the run.
    pub fn with_export_dir(mut self, target: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        self.export_dir = Some((target.into(), dir.into()));
        self
    }
}

fn existing_dir(path: &Path, what: &str) -> Result<PathBuf> {
    let canonical = path.canonicalize().map_err(|e| {
        RelayError::EnvironmentBuild(format!("{what} {}: {e}", path.display()))
    })?;
    if !canonical.is_dir() {
        return Err(RelayError::EnvironmentBuild(format!(
            "{what} {} is not a directory",
            path.display()
        )));
    }
    Ok(canonical)
}

/// Describe the invocation environment.
///
/// Base image, source tree at [`SOURCE_PATH`] (read-only), the named
/// dependency cache, the optional history directory, system packages, the
/// relay install step and, as the last build step, schema initialisation of
/// the store.
pub fn build(options: &BuildOptions) -> Result<Environment> {
    if options.image.trim().is_empty() {
        return Err(RelayError::EnvironmentBuild("base image cannot be empty".into()));
    }
    if options.cache_key.trim().is_empty() {
        return Err(RelayError::EnvironmentBuild("cache key cannot be empty".into()));
    }
    let source = existing_dir(&options.source_dir, "source directory")?;

    let mut env = Environment::from_image(options.image.clone())
        .with_directory(SOURCE_PATH, source, true)
        .with_cache(CACHE_PATH, options.cache_key.clone());

    let db_path = match &options.history_dir {
        Some(dir) => {
            let dir = existing_dir(dir, "history directory")?;
            env = env.with_directory(HISTORY_PATH, dir, false);
            format!("{HISTORY_PATH}/conversations.db")
        }
        None => EPHEMERAL_DB_PATH.to_string(),
    };

    if let Some((target, dir)) = &options.export_dir {
        let dir = existing_dir(dir, "export directory")?;
        env = env.with_export(target.clone(), dir);
    }

    let env = env
        .with_env_variable(RelaySettings::DB_PATH_VAR, db_path)
        .with_workdir(SOURCE_PATH)
        .with_exec(["apt-get", "update"])
        .with_exec(
            ["apt-get", "install", "-y", "--no-install-recommends"]
                .into_iter()
                .chain(SYSTEM_PACKAGES.iter().copied()),
        )
        .with_exec([
            "cargo",
            "install",
            "--path",
            SOURCE_PATH,
            "--root",
            INSTALL_ROOT,
        ])
        .with_exec([RELAY_BIN, "init-db"]);

    info!(
        image = %options.image,
        cache = %options.cache_key,
        history = options.history_dir.is_some(),
        "environment described"
    );
    Ok(env)
}

/// Inject the credential and, optionally, a collaborator service reachable as [`SERVICE_ALIAS`].
pub fn bind(env: Environment, credential: SecretString, service: Option<ServiceHandle>) -> Environment {
    let env = env.with_secret_variable(RelaySettings::API_KEY_VAR, credential);
    match service {
        Some(service) => env.with_service_binding(SERVICE_ALIAS, service),
        None => env,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_build_layout() {
        let src = source();
        let env = build(&BuildOptions::new(src.path())).unwrap();

        assert_eq!(env.image(), DEFAULT_IMAGE);
        assert_eq!(env.directories().len(), 1);
        assert_eq!(env.directories()[0].target, SOURCE_PATH);
        assert!(env.directories()[0].read_only);
        assert_eq!(env.caches()[0].target, CACHE_PATH);
        assert_eq!(env.caches()[0].volume_name(), "llm-relay-cache-cargo");
        assert_eq!(env.variable("RELAY_DB_PATH"), Some(EPHEMERAL_DB_PATH));

        let steps = env.steps();
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0], vec!["apt-get".to_string(), "update".to_string()]);
        assert!(steps[1].contains(&"libssl-dev".to_string()));
        assert_eq!(&steps[2][..2], &["cargo".to_string(), "install".to_string()]);
        assert_eq!(
            steps.last().unwrap(),
            &vec![RELAY_BIN.to_string(), "init-db".to_string()]
        );
    }

    #[test]
    fn test_build_with_history_dir() {
        let src = source();
        let history = tempfile::tempdir().unwrap();
        let env = build(&BuildOptions::new(src.path()).with_history_dir(history.path())).unwrap();

        let mount = env
            .directories()
            .iter()
            .find(|d| d.target == HISTORY_PATH)
            .expect("history mount");
        assert!(!mount.read_only);
        assert_eq!(env.variable("RELAY_DB_PATH"), Some("/history/conversations.db"));
    }

    #[test]
    fn test_build_rejects_missing_dirs_and_empty_image() {
        let err = build(&BuildOptions::new("/no/such/source")).unwrap_err();
        assert!(matches!(err, RelayError::EnvironmentBuild(_)));

        let src = source();
        let err = build(&BuildOptions::new(src.path()).with_history_dir("/no/such/history"))
            .unwrap_err();
        assert!(matches!(err, RelayError::EnvironmentBuild(_)));

        let err = build(&BuildOptions::new(src.path()).with_image(" ")).unwrap_err();
        assert!(matches!(err, RelayError::EnvironmentBuild(_)));
    }

    #[test]
    fn test_same_cache_key_same_volume() {
        let src = source();
        let a = build(&BuildOptions::new(src.path()).with_cache_key("pip")).unwrap();
        let b = build(&BuildOptions::new(src.path()).with_cache_key("pip")).unwrap();
        assert_eq!(a.caches()[0].volume_name(), b.caches()[0].volume_name());
        assert_eq!(
            CacheMount { key: "a/b c".into(), target: "/x".into() }.volume_name(),
            "llm-relay-cache-a-b-c"
        );
    }

    #[test]
    fn test_descriptions_are_immutable_values() {
        let base = Environment::from_image("alpine:3");
        let with_step = base.clone().with_exec(["echo", "hi"]);
        assert!(base.steps().is_empty());
        assert_eq!(with_step.steps().len(), 1);
    }

    #[test]
    fn test_bind_secret_never_rendered() {
        let src = source();
        let env = bind(
            build(&BuildOptions::new(src.path())).unwrap(),
            SecretString::from("sk-ant-super-secret".to_string()),
            Some(ServiceHandle::new("relay-net", "api")),
        );
        assert_eq!(env.secret_names().collect::<Vec<_>>(), vec!["ANTHROPIC_API_KEY"]);
        assert_eq!(env.services()[0].alias, "svc");

        let plan = env.plan(&[RELAY_BIN, "invoke", "[]"]).unwrap();
        assert!(plan.args.iter().all(|a| !a.contains("sk-ant-super-secret")));
        assert!(!format!("{:?}", env).contains("sk-ant-super-secret"));
        assert!(!format!("{:?}", plan).contains("sk-ant-super-secret"));

        let idx = plan.args.iter().position(|a| a == "ANTHROPIC_API_KEY").unwrap();
        assert_eq!(plan.args[idx - 1], "-e");
        let net = plan.args.iter().position(|a| a == "--network").unwrap();
        assert_eq!(plan.args[net + 1], "relay-net");
    }

    #[test]
    fn test_plan_script_and_argv() {
        let env = Environment::from_image("alpine:3")
            .with_exec(["echo", "two words"])
            .with_env_variable("A", "1");
        let plan = env.plan(&["cat", "[{\"role\":\"user\"}]"]).unwrap();

        let image = plan.args.iter().position(|a| a == "alpine:3").unwrap();
        assert_eq!(&plan.args[image + 1..image + 3], &["sh", "-c"]);
        assert_eq!(
            plan.args[image + 3],
            "echo 'two words' || exit 16\nexec \"$@\""
        );
        assert_eq!(
            &plan.args[image + 4..],
            &["sh", "cat", "[{\"role\":\"user\"}]"]
        );
        assert!(plan.args.contains(&"A=1".to_string()));
        assert!(!plan.args.contains(&"--network".to_string()));
    }

    #[test]
    fn test_every_build_step_exits_with_build_code() {
        let src = source();
        let env = build(&BuildOptions::new(src.path())).unwrap();
        let plan = env.plan(&[RELAY_BIN, "invoke", "[]"]).unwrap();
        let script = plan
            .args
            .iter()
            .find(|a| a.ends_with("exec \"$@\""))
            .unwrap();

        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines.len(), 5);
        for line in &lines[..4] {
            assert!(line.ends_with("|| exit 16"), "unguarded step: {line}");
        }
        assert_eq!(lines[3], format!("{RELAY_BIN} init-db || exit 16"));
        assert_eq!(ErrorKind::from_exit_code(16), Some(ErrorKind::EnvironmentBuild));
    }

    #[test]
    fn test_plan_rejects_split_networks_and_empty_command() {
        let env = Environment::from_image("alpine:3")
            .with_service_binding("svc", ServiceHandle::new("net-a", "api"))
            .with_service_binding("db", ServiceHandle::new("net-b", "pg"));
        assert!(matches!(
            env.plan(&["true"]),
            Err(RelayError::EnvironmentBuild(_))
        ));

        let empty: [&str; 0] = [];
        assert!(Environment::from_image("alpine:3").plan(&empty).is_err());
    }
}
