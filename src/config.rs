//! Invocation configuration and process settings.
//!
//! [`InvocationConfig`] is the validated, explicit replacement for a global
//! config dictionary: it is built once and passed into the backend and the
//! environment builder. [`RelaySettings`] collects what the in-environment
//! process reads from its environment variables.

use crate::{error::Result, RelayError};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default model identifier.
pub const DEFAULT_MODEL: &str = "claude-3-opus-20240229";
/// Default provider base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
/// Fixed logical endpoint of the downstream service.
pub const DEFAULT_DISPATCH_URL: &str = "http://svc:8080/api/v1";
/// Store location when no path is configured.
pub const DEFAULT_DB_PATH: &str = "conversations.db";

/// Availability and latency targets for a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentCriteria {
    /// Latency target for a single provider call, in milliseconds. Calls
    /// that run longer are logged, not cut off.
    pub max_latency_ms: u64,
    /// Target availability, in `(0, 1]`.
    pub availability: f64,
}

impl Default for DeploymentCriteria {
    fn default() -> Self {
        Self {
            max_latency_ms: 2000,
            availability: 0.999,
        }
    }
}

/// Configuration for one model invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvocationConfig {
    /// Config schema version.
    pub version: String,

    /// Model identifier sent to the provider.
    pub model: String,

    /// Maximum tokens to generate.
    pub max_tokens: u32,

    /// Sampling temperature; omitted from the request when `None`.
    pub temperature: Option<f64>,

    pub deployment: DeploymentCriteria,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 1024,
            temperature: Some(0.7),
            deployment: DeploymentCriteria::default(),
        }
    }
}

impl InvocationConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_temperature(mut self, temp: Option<f64>) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_latency(mut self, latency: Duration) -> Self {
        self.deployment.max_latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn latency_target(&self) -> Duration {
        Duration::from_millis(self.deployment.max_latency_ms)
    }

    /// Reject configurations the provider would refuse or that make no sense.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(RelayError::InvalidConfig("model cannot be empty".into()));
        }
        if self.max_tokens == 0 {
            return Err(RelayError::InvalidConfig(
                "max_tokens must be greater than zero".into(),
            ));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=1.0).contains(&t) {
                return Err(RelayError::InvalidConfig(format!(
                    "temperature must be within [0, 1], got {t}"
                )));
            }
        }
        if self.deployment.max_latency_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "max_latency_ms must be greater than zero".into(),
            ));
        }
        let a = self.deployment.availability;
        if !(a > 0.0 && a <= 1.0) {
            return Err(RelayError::InvalidConfig(format!(
                "availability must be within (0, 1], got {a}"
            )));
        }
        Ok(())
    }

    /// Parse and validate a YAML config document.
    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)
            .map_err(|e| RelayError::InvalidConfig(format!("config YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML config file.
    #[cfg(feature = "yaml")]
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RelayError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }
}

/// Settings the in-environment process takes from its environment.
pub struct RelaySettings {
    /// Provider credential; required to invoke the model.
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub db_path: PathBuf,
    pub dispatch_url: String,
    /// Raw trace-propagation header (`TRACEPARENT`).
    pub trace_header: Option<String>,
}

impl std::fmt::Debug for RelaySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("db_path", &self.db_path)
            .field("dispatch_url", &self.dispatch_url)
            .field("trace_header", &self.trace_header)
            .finish()
    }
}

impl RelaySettings {
    pub const API_KEY_VAR: &'static str = "ANTHROPIC_API_KEY";
    pub const BASE_URL_VAR: &'static str = "ANTHROPIC_BASE_URL";
    pub const DB_PATH_VAR: &'static str = "RELAY_DB_PATH";
    pub const DISPATCH_URL_VAR: &'static str = "RELAY_DISPATCH_URL";
    pub const TRACE_HEADER_VAR: &'static str = "TRACEPARENT";

    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through an arbitrary lookup (empty values count as unset).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            api_key: get(Self::API_KEY_VAR).map(SecretString::from),
            base_url: get(Self::BASE_URL_VAR).unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            db_path: get(Self::DB_PATH_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            dispatch_url: get(Self::DISPATCH_URL_VAR)
                .unwrap_or_else(|| DEFAULT_DISPATCH_URL.to_string()),
            trace_header: get(Self::TRACE_HEADER_VAR),
        }
    }

    /// The credential, or a config error naming the missing variable.
    pub fn require_api_key(&self) -> Result<SecretString> {
        self.api_key.clone().ok_or_else(|| {
            RelayError::InvalidConfig(format!("{} is not set", Self::API_KEY_VAR))
        })
    }
}
