//! Error types for tagpilot-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading, parsing or validating configuration and
/// domain values.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure with the offending path.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file did not exist.
    #[error("configuration not found at {path}")]
    NotFound { path: PathBuf },

    /// YAML parse error on load, with the file path.
    #[error("failed to parse configuration at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// YAML parse error for in-memory input.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("max_concurrency must not be negative (got {0})")]
    NegativeConcurrency(i64),

    #[error("unsupported applications API kind '{0}' (expected 'argocd' or 'kubernetes')")]
    UnsupportedApiKind(String),

    #[error("invalid git batching settings: {0}")]
    InvalidBatching(String),

    #[error("invalid image reference '{0}'")]
    InvalidImageRef(String),

    #[error("invalid branch spec '{0}' (expected 'base' or 'base:target')")]
    InvalidBranchSpec(String),

    /// The application's source type cannot carry image overrides.
    #[error("application {app} has unsupported source type '{kind}'")]
    UnsupportedSource { app: String, kind: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
