use thiserror::Error;

/// Errors produced by the relay and its components.
///
/// Every variant is terminal for the current invocation: nothing is retried.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Neither a prompt nor an input file was supplied.
    #[error("missing input: either a prompt or a file must be provided")]
    MissingInput,

    /// The input was not valid JSON, or not a JSON list of messages.
    #[error("invalid input format: {0}")]
    InvalidInputFormat(String),

    /// Image, mount, package installation or container runtime failure.
    #[error("environment build failed: {0}")]
    EnvironmentBuild(String),

    /// Transport failure, non-success status or malformed body from the model API.
    #[error("provider error{}: {message}", fmt_status(.status))]
    Provider {
        /// HTTP status code, if the provider answered at all.
        status: Option<u16>,
        /// Response body or transport error description.
        message: String,
    },

    /// A content block of a type the classifier does not recognise.
    #[error("unknown response content type: {0}")]
    UnknownContentType(String),

    /// The conversation store could not be opened, written or read.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The downstream service was unreachable or answered with a non-2xx status.
    #[error("dispatch error{}: {body}", fmt_status(.status))]
    Dispatch {
        /// HTTP status code, if the service answered.
        status: Option<u16>,
        /// Response body or transport error description.
        body: String,
    },

    /// Invalid configuration detected before anything runs.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON (de)serialization failed outside of input loading.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Provider {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(err: rusqlite::Error) -> Self {
        RelayError::Persistence(err.to_string())
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Other(err.to_string())
    }
}

/// Coarse failure category, stable across the process boundary.
///
/// The in-environment process exits with [`ErrorKind::exit_code`]; the host
/// driver maps the code back with [`ErrorKind::from_exit_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    EnvironmentBuild,
    Provider,
    UnknownContentType,
    Persistence,
    Dispatch,
    Config,
    Other,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Input => 10,
            ErrorKind::Provider => 11,
            ErrorKind::UnknownContentType => 12,
            ErrorKind::Persistence => 13,
            ErrorKind::Dispatch => 14,
            ErrorKind::Config => 15,
            ErrorKind::EnvironmentBuild => 16,
            ErrorKind::Other => 1,
        }
    }

    /// Map an environment exit code back to a kind.
    ///
    /// Unknown non-zero codes come from the build steps (package install,
    /// schema init) or the container runtime itself.
    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            0 => None,
            10 => Some(ErrorKind::Input),
            11 => Some(ErrorKind::Provider),
            12 => Some(ErrorKind::UnknownContentType),
            13 => Some(ErrorKind::Persistence),
            14 => Some(ErrorKind::Dispatch),
            15 => Some(ErrorKind::Config),
            1 => Some(ErrorKind::Other),
            _ => Some(ErrorKind::EnvironmentBuild),
        }
    }
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::MissingInput | RelayError::InvalidInputFormat(_) => ErrorKind::Input,
            RelayError::EnvironmentBuild(_) => ErrorKind::EnvironmentBuild,
            RelayError::Provider { .. } => ErrorKind::Provider,
            RelayError::UnknownContentType(_) => ErrorKind::UnknownContentType,
            RelayError::Persistence(_) => ErrorKind::Persistence,
            RelayError::Dispatch { .. } => ErrorKind::Dispatch,
            RelayError::InvalidConfig(_) => ErrorKind::Config,
            RelayError::Json(_) | RelayError::Other(_) => ErrorKind::Other,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
