use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
pub type LaunchResult<T> = std::result::Result<T, LaunchError>;

/// Problems found while assembling a run configuration.
///
/// All of these are reported before any process is spawned.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required option `{field}`")]
    Missing { field: &'static str },

    #[error("invalid value {value:?} for `{field}`: {reason}")]
    Invalid { field: String, value: String, reason: String },

    #[error("unknown option `{0}`")]
    UnknownOption(String),

    #[error("conflicting options: {0}")]
    Conflict(String),
}

impl ConfigError {
    #[must_use]
    pub fn invalid(field: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid { field: field.to_string(), value: value.to_string(), reason: reason.into() }
    }
}

#[derive(Debug, Error)]
pub enum BackendConfigError {
    #[error("backend config not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("malformed backend config {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("invalid backend config: {0}")]
    Invalid(String),

    #[error("backend config disagrees with run configuration: {0}")]
    Mismatch(String),
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendConfigError),

    #[error("requested {requested} device(s) but only {available} accelerator(s) are available")]
    InsufficientDevices { requested: usize, available: usize },

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("failed to spawn rank {rank}: {source}")]
    Spawn {
        rank: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("rank {rank} failed with exit code {code}")]
    RankFailed { rank: usize, code: i32 },

    #[error("launch interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LaunchError {
    /// Process exit code to surface for this error.
    ///
    /// Configuration problems use 2; a failed rank passes its own code through.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Backend(_) => 2,
            Self::RankFailed { code, .. } => *code,
            Self::Interrupted => 130,
            _ => 1,
        }
    }
}
