//! Collaborator traits the engine consumes, plus their no-op defaults.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use wildmatch::WildMatch;

use tagpilot_core::types::{AppName, Application, ImageRef};
use tagpilot_sync::GitClientFactory;

use crate::dispatcher::PassResult;
use crate::error::{OrchestratorError, ResolveError};

// ---------------------------------------------------------------------------
// Registry and orchestrator
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RegistryResolver: Send + Sync {
    /// Tags published for `image`, optionally narrowed by `constraint`.
    async fn get_tags(
        &self,
        image: &ImageRef,
        constraint: Option<&str>,
    ) -> Result<Vec<String>, ResolveError>;

    /// The newest eligible tag among `tags`. `None` means nothing newer
    /// qualifies, which is not an error.
    async fn newest_version(
        &self,
        image: &ImageRef,
        constraint: Option<&str>,
        tags: &[String],
    ) -> Result<Option<String>, ResolveError>;
}

#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    async fn list_applications(
        &self,
        label_selector: Option<&str>,
    ) -> Result<Vec<Application>, OrchestratorError>;

    /// Keep applications whose name matches any glob in `patterns`; an empty
    /// pattern list keeps everything.
    fn filter_applications_for_update(
        &self,
        apps: Vec<Application>,
        patterns: &[String],
    ) -> Vec<Application> {
        if patterns.is_empty() {
            return apps;
        }
        let matchers: Vec<WildMatch> = patterns.iter().map(|p| WildMatch::new(p)).collect();
        apps.into_iter()
            .filter(|app| matchers.iter().any(|m| m.matches(&app.name.0)))
            .collect()
    }

    /// Persist `app`'s spec (API write-back).
    async fn update_spec(&self, app: &Application) -> Result<(), OrchestratorError>;
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Cycle,
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The per-repository cap for this pass was reached.
    RepoCap,
    /// Shutdown arrived while waiting for a dispatch slot.
    Cancelled,
    /// A previous dispatch of the same app is still running.
    InFlight,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::RepoCap => write!(f, "repo-cap"),
            SkipReason::Cancelled => write!(f, "cancelled"),
            SkipReason::InFlight => write!(f, "in-flight"),
        }
    }
}

/// Fire-and-forget metrics hooks. Implementations must not block.
pub trait Observer: Send + Sync {
    fn app_attempted(&self, _app: &AppName, _at: DateTime<Utc>) {}
    fn app_succeeded(&self, _app: &AppName, _at: DateTime<Utc>) {}
    fn app_update_duration(&self, _app: &AppName, _elapsed: Duration) {}
    fn pass_started(&self, _kind: PassKind) {}
    fn pass_finished(&self, _kind: PassKind, _elapsed: Duration, _result: &PassResult) {}
    fn app_skipped(&self, _app: &AppName, _reason: SkipReason) {}
    fn warm_up_completed(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub trait HealthMonitor: Send + Sync {
    /// `Some(reason)` stops the driver.
    fn fatal_error(&self) -> Option<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysHealthy;

impl HealthMonitor for AlwaysHealthy {
    fn fatal_error(&self) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Everything the driver talks to outside the process.
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn RegistryResolver>,
    pub orchestrator: Arc<dyn OrchestratorClient>,
    pub git: Arc<dyn GitClientFactory>,
    pub observer: Arc<dyn Observer>,
    pub health: Arc<dyn HealthMonitor>,
}

impl Collaborators {
    pub fn new(
        resolver: Arc<dyn RegistryResolver>,
        orchestrator: Arc<dyn OrchestratorClient>,
        git: Arc<dyn GitClientFactory>,
    ) -> Self {
        Self {
            resolver,
            orchestrator,
            git,
            observer: Arc::new(NoopObserver),
            health: Arc::new(AlwaysHealthy),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_health(mut self, health: Arc<dyn HealthMonitor>) -> Self {
        self.health = health;
        self
    }
}
