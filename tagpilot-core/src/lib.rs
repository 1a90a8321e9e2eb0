//! tagpilot core library: domain types, updater configuration, errors.
//!
//! - [`types`]: newtypes, applications, images and write-back targets
//! - [`config`]: [`UpdaterConfig`] loading and validation
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{ApplicationsApi, GitSettings, RunMode, SchedulePolicy, SigningMethod, UpdaterConfig};
pub use error::ConfigError;
pub use types::{
    AppName, Application, BranchSpec, Credentials, GitWriteBack, HelmParameter, HelmParams,
    ImageChange, ImageRef, ImageSpec, RepoUrl, SourceKind, WriteBackConfig, WriteBackTarget,
};
