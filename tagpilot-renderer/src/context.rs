//! Commit message context: the serializable payload handed to tera.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tagpilot_core::types::{AppName, ImageChange};

use crate::error::RenderError;

/// Everything a commit message template can reference.
///
/// One commit may carry changes for several applications that share a
/// repository and branch, so `apps` is a list even in the common case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitContext {
    pub repo_url: String,
    pub branch: String,
    pub apps: Vec<AppChangesCtx>,
    /// Total image changes across `apps`.
    pub change_count: usize,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppChangesCtx {
    pub app_name: String,
    pub changes: Vec<ChangeCtx>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeCtx {
    pub alias: String,
    pub image: String,
    /// Empty when the previous tag is unknown.
    pub old_tag: String,
    pub new_tag: String,
}

impl From<&ImageChange> for ChangeCtx {
    fn from(change: &ImageChange) -> Self {
        Self {
            alias: change.alias.clone(),
            image: change.image.clone(),
            old_tag: change.old_tag.clone().unwrap_or_default(),
            new_tag: change.new_tag.clone(),
        }
    }
}

impl CommitContext {
    pub fn new(repo_url: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            branch: branch.into(),
            apps: Vec::new(),
            change_count: 0,
            generated_at: Utc::now(),
        }
    }

    /// Append one application's changes, merging with an earlier entry of the
    /// same name.
    pub fn push_app(&mut self, app: &AppName, changes: &[ImageChange]) {
        self.change_count += changes.len();
        let converted = changes.iter().map(ChangeCtx::from);
        match self.apps.iter_mut().find(|a| a.app_name == app.0) {
            Some(existing) => existing.changes.extend(converted),
            None => self.apps.push(AppChangesCtx {
                app_name: app.0.clone(),
                changes: converted.collect(),
            }),
        }
    }

    pub fn to_tera_context(&self) -> Result<tera::Context, RenderError> {
        tera::Context::from_serialize(self).map_err(RenderError::from)
    }
}
