//! Updater configuration loaded from YAML.
//!
//! Every field has a serde default, so an empty mapping is a valid
//! configuration. Semantic checks that serde cannot express live in
//! [`UpdaterConfig::validate`], which [`load_at`] runs before returning.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};

// ---------------------------------------------------------------------------
// 1. Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Full passes every `check_interval`.
    #[default]
    Cycle,
    /// Per-application due times evaluated every tick.
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulePolicy {
    #[default]
    Default,
    Lru,
    #[serde(alias = "failfirst")]
    FailFirst,
}

/// Backend used to list and update applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationsApi {
    Argocd,
    Kubernetes,
}

impl std::str::FromStr for ApplicationsApi {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "argocd" => Ok(Self::Argocd),
            "kubernetes" | "" => Ok(Self::Kubernetes),
            other => Err(ConfigError::UnsupportedApiKind(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SigningMethod {
    #[default]
    Openpgp,
    Ssh,
}

// ---------------------------------------------------------------------------
// 2. Settings
// ---------------------------------------------------------------------------

/// Commit identity, signing and batching for Git write-back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSettings {
    pub user: String,
    pub email: String,
    /// Tera template overriding the built-in commit message.
    pub commit_message_template: Option<String>,
    pub signing_key: Option<String>,
    pub signing_method: SigningMethod,
    pub sign_off: bool,
    /// Intents per repository that trigger an immediate flush.
    pub max_batch: usize,
    /// Delay after the first unflushed intent before a flush; 0 disables the timer.
    pub flush_every_ms: u64,
    /// Capacity of each repository's intent queue.
    pub queue_depth: usize,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            user: "tagpilot".to_string(),
            email: "noreply@tagpilot.local".to_string(),
            commit_message_template: None,
            signing_key: None,
            signing_method: SigningMethod::Openpgp,
            sign_off: false,
            max_batch: 10,
            flush_every_ms: 2000,
            queue_depth: 64,
        }
    }
}

impl GitSettings {
    pub fn flush_every(&self) -> Option<Duration> {
        (self.flush_every_ms > 0).then(|| Duration::from_millis(self.flush_every_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    pub mode: RunMode,
    /// 0 runs a single pass and exits.
    pub check_interval_secs: u64,
    /// 0 picks a value from the CPU count.
    pub max_concurrency: i64,
    pub schedule: SchedulePolicy,
    pub cooldown_secs: u64,
    /// 0 means unlimited.
    pub per_repo_cap: usize,
    pub dry_run: bool,
    pub warm_up: bool,
    pub applications_api: String,
    pub label_selector: Option<String>,
    pub app_name_patterns: Vec<String>,
    pub git: GitSettings,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Cycle,
            check_interval_secs: 120,
            max_concurrency: 10,
            schedule: SchedulePolicy::Default,
            cooldown_secs: 0,
            per_repo_cap: 0,
            dry_run: false,
            warm_up: false,
            applications_api: "kubernetes".to_string(),
            label_selector: None,
            app_name_patterns: Vec::new(),
            git: GitSettings::default(),
        }
    }
}

impl UpdaterConfig {
    /// Parse without touching the filesystem. Runs [`Self::validate`].
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would fail at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency < 0 {
            return Err(ConfigError::NegativeConcurrency(self.max_concurrency));
        }
        self.api_kind()?;
        if self.git.max_batch == 0 {
            return Err(ConfigError::InvalidBatching(
                "max_batch must be at least 1".into(),
            ));
        }
        if self.git.queue_depth == 0 {
            return Err(ConfigError::InvalidBatching(
                "queue_depth must be at least 1".into(),
            ));
        }
        // Without a timer a partial batch would only flush at shutdown while
        // its submitters wait on the outcome.
        if self.git.flush_every_ms == 0 && self.git.max_batch > 1 {
            return Err(ConfigError::InvalidBatching(
                "flush_every_ms = 0 requires max_batch = 1".into(),
            ));
        }
        Ok(())
    }

    pub fn api_kind(&self) -> Result<ApplicationsApi, ConfigError> {
        self.applications_api.parse()
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Configured concurrency; `None` means auto. Call after `validate`.
    pub fn concurrency(&self) -> Option<usize> {
        match self.max_concurrency {
            n if n > 0 => Some(n as usize),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// 3. Load
// ---------------------------------------------------------------------------

/// Load and validate a configuration file.
///
/// Returns `ConfigError::NotFound` if absent and `ConfigError::Parse` (with
/// path and line context) if the YAML is malformed.
pub fn load_at(path: &Path) -> Result<UpdaterConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let config: UpdaterConfig = serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    config.validate()?;
    Ok(config)
}
