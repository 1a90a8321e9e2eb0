//! Write requests handed from update workers to the write coordinator.

use tagpilot_core::types::{AppName, GitWriteBack, ImageChange, RepoUrl};

use crate::manifest::ManifestEdit;

/// A request to persist one application's resolved image changes.
///
/// Created once per worker per pass and consumed by exactly one flush.
#[derive(Debug, Clone)]
pub struct WriteIntent {
    pub app: AppName,
    pub write_back: GitWriteBack,
    pub changes: Vec<ImageChange>,
    pub edit: ManifestEdit,
}

impl WriteIntent {
    pub fn repo(&self) -> &RepoUrl {
        &self.write_back.repo_url
    }
}

/// What happened to an intent once its batch was flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The edit changed a file and the group's commit was pushed to `branch`.
    Committed { branch: String },
    /// The edit produced byte-identical content; nothing was written.
    Unchanged,
}
