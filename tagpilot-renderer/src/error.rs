//! Error types for tagpilot-renderer.

use thiserror::Error;

/// All errors that can arise while building or rendering commit messages.
#[derive(Debug, Error)]
pub enum RenderError {
    /// Tera parse or render error. Custom templates fail here at load time.
    #[error("template engine error: {0}")]
    Tera(#[from] tera::Error),

    /// JSON serialization error (building tera context).
    #[error("context serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
