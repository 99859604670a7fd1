//! # llm-relay
//!
//! Host driver and in-environment entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use llm_relay::config::{InvocationConfig, RelaySettings};
use llm_relay::env::{BuildOptions, ServiceHandle, DEFAULT_CACHE_KEY, DEFAULT_IMAGE};
use llm_relay::pipeline::{Pipeline, PipelineFailure, PipelineRequest};
use llm_relay::store::ConversationStore;
use llm_relay::types::{ChatMessage, Role};
use llm_relay::{invocation, loader, logging, ExecCtx, RelayError};

/// Where exported artifacts are mounted inside the environment.
const EXPORT_TARGET: &str = "/export";

/// Send a prompt to a hosted LLM, record the exchange and forward it downstream.
#[derive(Parser, Debug)]
#[command(name = "llm-relay", version, about)]
struct Cli {
    /// YAML file with the invocation config (model, max_tokens, temperature, deployment).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = logging::DEFAULT_LEVEL)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the environment and run one invocation inside it.
    Request {
        /// Prompt text; wins over --file.
        #[arg(short, long)]
        prompt: Option<String>,

        /// JSON file holding a list of messages.
        #[arg(short, long)]
        file: Option<PathBuf>,

        #[arg(long, default_value = "user")]
        role: String,

        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        env: EnvArgs,
    },
    /// Shorthand for `request --prompt`.
    Chat {
        prompt: String,

        #[arg(long, default_value = "user")]
        role: String,

        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        env: EnvArgs,
    },
    /// Run one invocation in the current process (the environment entry point).
    Invoke {
        /// A JSON list of messages, or a raw prompt.
        input: String,

        /// Role for a raw prompt.
        #[arg(long, default_value = "user")]
        role: String,

        /// Also write the reply to this file.
        #[arg(long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        model: ModelArgs,
    },
    /// Create the conversation table if it does not exist.
    InitDb,
    /// Print one stored conversation as JSON.
    Get { id: i64 },
    /// Write every stored conversation to a JSON file.
    Dump { destination: PathBuf },
}

#[derive(Args, Debug, Clone)]
struct ModelArgs {
    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    max_tokens: Option<u32>,

    #[arg(long)]
    temperature: Option<f64>,

    /// Provider request timeout in milliseconds.
    #[arg(long)]
    max_latency_ms: Option<u64>,
}

#[derive(Args, Debug, Clone)]
struct EnvArgs {
    /// Source tree installed into the environment.
    #[arg(long, default_value = ".")]
    source: PathBuf,

    #[arg(long, default_value = DEFAULT_IMAGE)]
    image: String,

    #[arg(long, default_value = DEFAULT_CACHE_KEY)]
    cache_key: String,

    /// Host directory that keeps the conversation store across runs.
    #[arg(long)]
    history: Option<PathBuf>,

    /// Host directory the reply is exported to.
    #[arg(long)]
    export: Option<PathBuf>,

    /// Docker network of the downstream service.
    #[arg(long, requires = "service_container")]
    service_network: Option<String>,

    /// Container name of the downstream service.
    #[arg(long, requires = "service_network")]
    service_container: Option<String>,
}

impl EnvArgs {
    fn build_options(&self) -> BuildOptions {
        let mut options = BuildOptions::new(&self.source)
            .with_image(self.image.clone())
            .with_cache_key(self.cache_key.clone());
        if let Some(history) = &self.history {
            options = options.with_history_dir(history);
        }
        if let Some(export) = &self.export {
            options = options.with_export_dir(EXPORT_TARGET, export);
        }
        options
    }

    fn service(&self) -> Option<ServiceHandle> {
        match (&self.service_network, &self.service_container) {
            (Some(network), Some(container)) => Some(ServiceHandle::new(network, container)),
            _ => None,
        }
    }
}

fn load_config(path: Option<&PathBuf>, overrides: &ModelArgs) -> Result<InvocationConfig> {
    let mut config = match path {
        #[cfg(feature = "yaml")]
        Some(path) => InvocationConfig::from_yaml_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        #[cfg(not(feature = "yaml"))]
        Some(path) => {
            return Err(RelayError::InvalidConfig(format!(
                "{}: built without the `yaml` feature",
                path.display()
            ))
            .into())
        }
        None => InvocationConfig::default(),
    };
    if let Some(model) = &overrides.model {
        config = config.with_model(model.clone());
    }
    if let Some(tokens) = overrides.max_tokens {
        config = config.with_max_tokens(tokens);
    }
    if let Some(t) = overrides.temperature {
        config = config.with_temperature(Some(t));
    }
    if let Some(ms) = overrides.max_latency_ms {
        config = config.with_max_latency(std::time::Duration::from_millis(ms));
    }
    config.validate()?;
    Ok(config)
}

/// Print the partial artifact and the error; exit with the failure kind.
fn report_failure(failure: &PipelineFailure) -> ExitCode {
    if let Some(artifact) = &failure.artifact {
        print!("{artifact}");
        if !artifact.ends_with('\n') {
            println!();
        }
    }
    eprintln!("error: {}", failure.error);
    exit_code(failure.kind().exit_code())
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn request(
    cli: &Cli,
    messages: Vec<ChatMessage>,
    model: &ModelArgs,
    env: &EnvArgs,
) -> Result<ExitCode> {
    let config = load_config(cli.config.as_ref(), model)?;
    let settings = RelaySettings::from_env();
    let credential = settings.require_api_key()?;

    let mut request = PipelineRequest::new(messages, env.build_options())
        .with_config(config)
        .with_trace_header(settings.trace_header.clone());
    if let Some(service) = env.service() {
        request = request.with_service(service);
    }

    match Pipeline::builder().build().run(credential, &request).await {
        Ok(report) => {
            print!("{}", report.stdout);
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => Ok(report_failure(&failure)),
    }
}

async fn invoke(
    cli: &Cli,
    input: &str,
    role: &str,
    out: Option<&PathBuf>,
    model: &ModelArgs,
) -> Result<ExitCode> {
    let config = load_config(cli.config.as_ref(), model)?;
    let messages = loader::from_argument(input, Role::from(role))?;
    let ctx = ExecCtx::from_settings(&RelaySettings::from_env(), config)?;

    match invocation::run(&ctx, messages).await {
        Ok(outcome) => {
            if let Some(out) = out {
                std::fs::write(out, &outcome.output)
                    .with_context(|| format!("writing {}", out.display()))?;
            }
            println!("{}", outcome.output);
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => Ok(report_failure(&failure)),
    }
}

fn store() -> ConversationStore {
    ConversationStore::new(RelaySettings::from_env().db_path)
}

async fn run(cli: &Cli) -> Result<ExitCode> {
    match &cli.command {
        Command::Request {
            prompt,
            file,
            role,
            model,
            env,
        } => {
            let messages = loader::load(prompt.as_deref(), file.as_deref(), Role::from(role.as_str()))?;
            request(cli, messages, model, env).await
        }
        Command::Chat {
            prompt,
            role,
            model,
            env,
        } => {
            let messages = loader::load(Some(prompt.as_str()), None, Role::from(role.as_str()))?;
            request(cli, messages, model, env).await
        }
        Command::Invoke {
            input,
            role,
            out,
            model,
        } => invoke(cli, input, role, out.as_ref(), model).await,
        Command::InitDb => {
            store().init_schema()?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Get { id } => {
            let record = store()
                .get(*id)?
                .with_context(|| format!("no conversation with id {id}"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Dump { destination } => {
            let rows = store().dump_all(destination)?;
            eprintln!("dumped {rows} conversations to {}", destination.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_json);

    match run(&cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<RelayError>()
                .map(|e| e.kind().exit_code())
                .unwrap_or(1);
            exit_code(code)
        }
    }
}
