//! Per-application update check and write-back.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use tagpilot_core::types::{Application, ImageChange, ImageSpec, WriteBackConfig};
use tagpilot_sync::{ManifestEdit, WriteCoordinator, WriteIntent, WriteOutcome};

use crate::dispatcher::{AppResult, AppWork, PassContext};
use crate::error::{EngineError, ResolveError};
use crate::ports::{Observer, OrchestratorClient, RegistryResolver};

/// Resolves newer tags for an application's images and persists them through
/// the orchestrator API or the write coordinator.
pub struct UpdateWorker {
    resolver: Arc<dyn RegistryResolver>,
    orchestrator: Arc<dyn OrchestratorClient>,
    coordinator: Arc<WriteCoordinator>,
    observer: Arc<dyn Observer>,
}

impl UpdateWorker {
    pub fn new(
        resolver: Arc<dyn RegistryResolver>,
        orchestrator: Arc<dyn OrchestratorClient>,
        coordinator: Arc<WriteCoordinator>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            resolver,
            orchestrator,
            coordinator,
            observer,
        }
    }

    /// The newest tag for `spec` if it differs from the deployed one.
    async fn newer_tag(&self, spec: &ImageSpec) -> Result<Option<String>, ResolveError> {
        let constraint = spec.constraint.as_deref();
        let tags = self.resolver.get_tags(&spec.image, constraint).await?;
        let newest = self
            .resolver
            .newest_version(&spec.image, constraint, &tags)
            .await?;
        Ok(newest.filter(|tag| spec.image.tag.as_deref() != Some(tag.as_str())))
    }

    /// Returns how many images were actually written.
    async fn write_back(
        &self,
        app: &Application,
        changes: Vec<ImageChange>,
    ) -> Result<usize, EngineError> {
        match &app.write_back {
            WriteBackConfig::Api => {
                let mut updated = app.clone();
                updated.apply_image_changes(&changes)?;
                self.orchestrator.update_spec(&updated).await?;
                Ok(changes.len())
            }
            WriteBackConfig::Git(git) => {
                let edit = ManifestEdit::for_application(app, &git.target)?;
                let count = changes.len();
                let outcome = self
                    .coordinator
                    .submit(WriteIntent {
                        app: app.name.clone(),
                        write_back: git.clone(),
                        changes,
                        edit,
                    })
                    .await?;
                Ok(match outcome {
                    WriteOutcome::Committed { .. } => count,
                    WriteOutcome::Unchanged => 0,
                })
            }
        }
    }
}

#[async_trait]
impl AppWork for UpdateWorker {
    async fn run(&self, app: Application, ctx: PassContext) -> AppResult {
        let started = Instant::now();
        let attempted_at = ctx.state.record_attempt(&app.name);
        self.observer.app_attempted(&app.name, attempted_at);

        let mut result = AppResult::default();
        let mut changes = Vec::new();
        for spec in &app.images {
            result.images_considered += 1;
            match self.newer_tag(spec).await {
                Ok(Some(tag)) => {
                    tracing::info!(
                        app = %app.name,
                        image = %spec.image.name,
                        from = spec.image.tag.as_deref().unwrap_or(""),
                        to = %tag,
                        "newer image tag found",
                    );
                    changes.push(ImageChange::from_spec(spec, &tag));
                }
                Ok(None) => {
                    tracing::debug!(app = %app.name, image = %spec.image, "image is up to date");
                }
                Err(err) => {
                    result.errors += 1;
                    tracing::warn!(app = %app.name, image = %spec.image, error = %err, "could not resolve image version");
                }
            }
        }

        if !changes.is_empty() {
            if ctx.dry_run {
                tracing::info!(app = %app.name, images = changes.len(), "dry run, not writing back");
                result.images_updated += changes.len();
            } else {
                match self.write_back(&app, changes).await {
                    Ok(written) => result.images_updated += written,
                    Err(err) => {
                        result.errors += 1;
                        tracing::error!(app = %app.name, error = %err, "write-back failed");
                    }
                }
            }
        }

        let failed = result.errors > 0;
        let finished_at = ctx.state.record_result(&app.name, failed);
        if !failed {
            self.observer.app_succeeded(&app.name, finished_at);
        }
        self.observer.app_update_duration(&app.name, started.elapsed());
        result
    }
}
