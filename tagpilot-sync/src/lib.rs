//! Git write-back for tagpilot: manifest edits, git access and the
//! per-repository write coordinator.

pub mod coordinator;
pub mod error;
pub mod git;
pub mod intent;
pub mod locks;
pub mod manifest;

pub use coordinator::{group_in_order, WriteCoordinator};
pub use error::WriteBackError;
pub use git::{
    default_branch, prepare_checkout, CheckoutPlan, CliGitClient, CliGitFactory, CommitMessage,
    CommitOptions, GitClient, GitClientFactory,
};
pub use intent::{WriteIntent, WriteOutcome};
pub use locks::{RepoLock, RepoLocks};
pub use manifest::{ApplyOutcome, ManifestEdit};
