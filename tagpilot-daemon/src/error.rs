use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the engine driver and runtime.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] tagpilot_core::ConfigError),

    #[error("commit template error: {0}")]
    Render(#[from] tagpilot_renderer::RenderError),

    #[error("write-back error: {0}")]
    WriteBack(#[from] tagpilot_sync::WriteBackError),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("registry error: {0}")]
    Resolve(#[from] ResolveError),

    /// The health monitor reported a condition that stops the engine.
    #[error("health check failed: {0}")]
    Unhealthy(String),
}

/// Failures reported by a [`crate::RegistryResolver`].
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("registry request for {image} failed: {message}")]
    Registry { image: String, message: String },

    #[error("invalid version constraint '{constraint}': {message}")]
    Constraint { constraint: String, message: String },
}

/// Failures reported by an [`crate::OrchestratorClient`].
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator API error: {0}")]
    Api(String),

    #[error("application {0} not found")]
    NotFound(String),

    /// The live spec changed between read and update.
    #[error("conflicting update for application {0}")]
    Conflict(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.into(),
        source,
    }
}
