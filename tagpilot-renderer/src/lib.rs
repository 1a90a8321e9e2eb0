//! # tagpilot-renderer
//!
//! Tera-based commit message rendering for Git write-back.
//!
//! ```rust,no_run
//! use tagpilot_renderer::{CommitContext, CommitMessageRenderer};
//!
//! fn message(ctx: &CommitContext) -> Option<String> {
//!     CommitMessageRenderer::new(None).ok()?.render(ctx).ok()
//! }
//! ```

pub mod context;
pub mod engine;
pub mod error;

pub use context::CommitContext;
pub use engine::CommitMessageRenderer;
pub use error::RenderError;
