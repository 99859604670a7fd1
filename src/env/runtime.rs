//! Container runtimes that execute a rendered [`RunPlan`].

use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;
use tracing::{debug, warn};

use super::ServiceBinding;
use crate::error::Result;
use crate::RelayError;

/// A fully rendered container invocation.
///
/// `args` never contains secret values; `secrets` are handed to the runtime
/// process environment only.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub program: String,
    pub args: Vec<String>,
    pub secrets: Vec<(String, SecretString)>,
    pub services: Vec<ServiceBinding>,
}

/// What the final command produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes run plans.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run(&self, plan: &RunPlan) -> Result<ExecOutput>;

    fn name(&self) -> &'static str;
}

/// Runs plans with the local `docker` CLI.
#[derive(Debug, Clone, Default)]
pub struct DockerRuntime;

impl DockerRuntime {
    /// Attach each bound service container to its network under the binding alias.
    ///
    /// A container that is already attached counts as bound; any other
    /// failure stops the run before the container starts.
    async fn connect_services(&self, plan: &RunPlan) -> Result<()> {
        for binding in &plan.services {
            let output = Command::new(&plan.program)
                .args([
                    "network",
                    "connect",
                    "--alias",
                    binding.alias.as_str(),
                    binding.service.network.as_str(),
                    binding.service.container.as_str(),
                ])
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| RelayError::EnvironmentBuild(format!("{}: {e}", plan.program)))?;

            if output.status.success() {
                continue;
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("already exists") {
                debug!(alias = %binding.alias, "service already attached");
                continue;
            }
            warn!(
                alias = %binding.alias,
                container = %binding.service.container,
                stderr = %stderr.trim(),
                "service binding failed"
            );
            return Err(RelayError::EnvironmentBuild(format!(
                "cannot bind {} as `{}` on network {}: {}",
                binding.service.container,
                binding.alias,
                binding.service.network,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run(&self, plan: &RunPlan) -> Result<ExecOutput> {
        self.connect_services(plan).await?;

        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (name, value) in &plan.secrets {
            cmd.env(name, value.expose_secret());
        }

        debug!(program = %plan.program, args = plan.args.len(), "spawning container");
        let output = cmd
            .output()
            .await
            .map_err(|e| RelayError::EnvironmentBuild(format!("{}: {e}", plan.program)))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

/// A runtime that records plans and answers with a canned output.
#[derive(Debug)]
pub struct RecordingRuntime {
    reply: ExecOutput,
    plans: Mutex<Vec<RunPlan>>,
}

impl RecordingRuntime {
    pub fn new(reply: ExecOutput) -> Self {
        Self {
            reply,
            plans: Mutex::new(Vec::new()),
        }
    }

    /// Exit 0 with the given stdout.
    pub fn succeeding(stdout: impl Into<String>) -> Self {
        Self::new(ExecOutput {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        })
    }

    pub fn exiting(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self::new(ExecOutput {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        })
    }

    pub fn plans(&self) -> Vec<RunPlan> {
        self.plans.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ContainerRuntime for RecordingRuntime {
    async fn run(&self, plan: &RunPlan) -> Result<ExecOutput> {
        if let Ok(mut plans) = self.plans.lock() {
            plans.push(plan.clone());
        }
        Ok(self.reply.clone())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}
