//! Error types for tagpilot-sync.

use std::path::PathBuf;

use thiserror::Error;

use tagpilot_core::ConfigError;
use tagpilot_renderer::RenderError;

/// All errors that can arise from Git write-back.
#[derive(Debug, Error)]
pub enum WriteBackError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A manifest in the working tree is not valid YAML or has the wrong shape.
    #[error("failed to edit manifest at {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A git subprocess failed. `message` never contains credentials.
    #[error("git {op} failed: {message}")]
    Git { op: &'static str, message: String },

    #[error("render error: {0}")]
    Render(#[from] RenderError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The writer reported a failure for this intent.
    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("write coordinator is shutting down")]
    ShuttingDown,

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Convenience constructor for [`WriteBackError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> WriteBackError {
    WriteBackError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn manifest_err(path: impl Into<PathBuf>, reason: impl Into<String>) -> WriteBackError {
    WriteBackError::Manifest {
        path: path.into(),
        reason: reason.into(),
    }
}
