//! Git access for write-back.
//!
//! [`GitClient`] is the seam the coordinator drives; [`CliGitClient`] runs the
//! `git` binary through `tokio::process::Command` in a temporary clone root.
//! Credentials embedded in remote URLs are scrubbed from every error message.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;

use tagpilot_core::types::{BranchSpec, Credentials, RepoUrl};
use tagpilot_core::{GitSettings, SigningMethod};

use crate::error::{io_err, WriteBackError};

const REDACTED: &str = "[REDACTED]";

/// Commit message source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitMessage {
    Inline(String),
    /// A file passed with `git commit -F`.
    Path(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOptions {
    pub message: CommitMessage,
    pub signing_key: Option<String>,
    pub signing_method: SigningMethod,
    pub sign_off: bool,
}

#[async_trait]
pub trait GitClient: Send + Sync {
    /// Working tree root.
    fn root(&self) -> &Path;
    async fn init(&self) -> Result<(), WriteBackError>;
    async fn fetch(&self) -> Result<(), WriteBackError>;
    /// The remote's default branch, from its symbolic `HEAD`.
    async fn sym_ref_to_branch(&self) -> Result<String, WriteBackError>;
    async fn checkout(&self, branch: &str) -> Result<(), WriteBackError>;
    async fn add(&self, paths: &[PathBuf]) -> Result<(), WriteBackError>;
    async fn commit(&self, pathspec: &[PathBuf], opts: &CommitOptions) -> Result<(), WriteBackError>;
    /// Push the checked-out `HEAD` to `branch` on `remote`.
    async fn push(&self, remote: &str, branch: &str, force: bool) -> Result<(), WriteBackError>;
}

/// Builds one client per flushed branch group.
pub trait GitClientFactory: Send + Sync {
    fn create(
        &self,
        repo: &RepoUrl,
        credentials: &Credentials,
    ) -> Result<Box<dyn GitClient>, WriteBackError>;
}

/// Branches resolved for one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutPlan {
    pub checkout: String,
    pub push: String,
    pub force: bool,
}

impl CheckoutPlan {
    /// Resolve `branch` against the remote's default branch, which is only
    /// consulted for an empty or `HEAD` base.
    ///
    /// With `base:target` the push goes to `target` and is forced, since the
    /// target branch is rebuilt from `base` on every write.
    pub fn resolve(branch: &BranchSpec, default_branch: &str) -> Self {
        let checkout = match &branch.base {
            Some(base) if !branch.needs_default_branch() => base.clone(),
            _ => default_branch.to_owned(),
        };
        match &branch.target {
            Some(target) if *target != checkout => Self {
                checkout,
                push: target.clone(),
                force: true,
            },
            _ => Self {
                push: checkout.clone(),
                checkout,
                force: false,
            },
        }
    }
}

/// `init`, `fetch` and read the remote's default branch.
pub async fn default_branch(client: &dyn GitClient) -> Result<String, WriteBackError> {
    client.init().await?;
    client.fetch().await?;
    client.sym_ref_to_branch().await
}

/// `init`, `fetch` and check out `plan.checkout`.
pub async fn prepare_checkout(
    client: &dyn GitClient,
    plan: &CheckoutPlan,
) -> Result<(), WriteBackError> {
    client.init().await?;
    client.fetch().await?;
    client.checkout(&plan.checkout).await
}

// ---------------------------------------------------------------------------
// CLI implementation
// ---------------------------------------------------------------------------

/// Creates [`CliGitClient`]s with the configured commit identity.
#[derive(Debug, Clone)]
pub struct CliGitFactory {
    user: String,
    email: String,
}

impl CliGitFactory {
    pub fn new(settings: &GitSettings) -> Self {
        Self {
            user: settings.user.clone(),
            email: settings.email.clone(),
        }
    }
}

impl GitClientFactory for CliGitFactory {
    fn create(
        &self,
        repo: &RepoUrl,
        credentials: &Credentials,
    ) -> Result<Box<dyn GitClient>, WriteBackError> {
        let root = tempfile::Builder::new()
            .prefix("tagpilot-")
            .tempdir()
            .map_err(|e| io_err(std::env::temp_dir(), e))?;
        Ok(Box::new(CliGitClient::new(
            root,
            repo,
            credentials,
            &self.user,
            &self.email,
        )))
    }
}

pub struct CliGitClient {
    root: TempDir,
    remote_url: String,
    secret: Option<String>,
    ssh_key: Option<PathBuf>,
    user: String,
    email: String,
}

impl CliGitClient {
    pub fn new(
        root: TempDir,
        repo: &RepoUrl,
        credentials: &Credentials,
        user: &str,
        email: &str,
    ) -> Self {
        let (remote_url, secret, ssh_key) = match credentials {
            Credentials::Anonymous => (repo.0.clone(), None, None),
            Credentials::Token { username, token } => {
                (with_token(&repo.0, username, token), Some(token.clone()), None)
            }
            Credentials::SshKey { path } => (repo.0.clone(), None, Some(path.clone())),
        };
        Self {
            root,
            remote_url,
            secret,
            ssh_key,
            user: user.to_owned(),
            email: email.to_owned(),
        }
    }

    fn redact(&self, text: &str) -> String {
        match &self.secret {
            Some(secret) if !secret.is_empty() => text.replace(secret.as_str(), REDACTED),
            _ => text.to_owned(),
        }
    }

    async fn run<I, S>(&self, op: &'static str, args: I) -> Result<String, WriteBackError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(self.root.path())
            .env("GIT_TERMINAL_PROMPT", "0");
        if let Some(key) = &self.ssh_key {
            cmd.env(
                "GIT_SSH_COMMAND",
                format!("ssh -i {} -o IdentitiesOnly=yes", key.display()),
            );
        }
        tracing::debug!(op, root = %self.root.path().display(), "running git");

        let output = cmd.output().await.map_err(|e| WriteBackError::Git {
            op,
            message: e.to_string(),
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WriteBackError::Git {
                op,
                message: self.redact(stderr.trim()),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl GitClient for CliGitClient {
    fn root(&self) -> &Path {
        self.root.path()
    }

    async fn init(&self) -> Result<(), WriteBackError> {
        self.run("init", ["init", "--quiet"]).await?;
        self.run("remote", ["remote", "add", "origin", self.remote_url.as_str()])
            .await?;
        self.run("config", ["config", "user.name", self.user.as_str()])
            .await?;
        self.run("config", ["config", "user.email", self.email.as_str()])
            .await?;
        Ok(())
    }

    async fn fetch(&self) -> Result<(), WriteBackError> {
        self.run("fetch", ["fetch", "--quiet", "--prune", "origin"])
            .await
            .map(|_| ())
    }

    async fn sym_ref_to_branch(&self) -> Result<String, WriteBackError> {
        let out = self
            .run("ls-remote", ["ls-remote", "--symref", "origin", "HEAD"])
            .await?;
        parse_symref(&out).ok_or_else(|| WriteBackError::Git {
            op: "ls-remote",
            message: "remote HEAD is not a symbolic ref".into(),
        })
    }

    async fn checkout(&self, branch: &str) -> Result<(), WriteBackError> {
        let remote_ref = format!("origin/{branch}");
        self.run(
            "checkout",
            ["checkout", "--quiet", "--force", "-B", branch, remote_ref.as_str()],
        )
        .await
        .map(|_| ())
    }

    async fn add(&self, paths: &[PathBuf]) -> Result<(), WriteBackError> {
        let mut args: Vec<std::ffi::OsString> = vec!["add".into(), "--".into()];
        args.extend(paths.iter().map(|p| p.as_os_str().to_owned()));
        self.run("add", args).await.map(|_| ())
    }

    async fn commit(&self, pathspec: &[PathBuf], opts: &CommitOptions) -> Result<(), WriteBackError> {
        let mut args: Vec<std::ffi::OsString> = Vec::new();
        if opts.signing_key.is_some() && opts.signing_method == SigningMethod::Ssh {
            args.extend(["-c".into(), "gpg.format=ssh".into()]);
        }
        args.push("commit".into());
        args.push("--quiet".into());
        match &opts.message {
            CommitMessage::Inline(message) => {
                args.extend(["-m".into(), message.into()]);
            }
            CommitMessage::Path(path) => {
                args.extend(["-F".into(), path.as_os_str().to_owned()]);
            }
        }
        if opts.sign_off {
            args.push("--signoff".into());
        }
        if let Some(key) = &opts.signing_key {
            args.push(format!("-S{key}").into());
        }
        if !pathspec.is_empty() {
            args.push("--".into());
            args.extend(pathspec.iter().map(|p| p.as_os_str().to_owned()));
        }
        self.run("commit", args).await.map(|_| ())
    }

    async fn push(&self, remote: &str, branch: &str, force: bool) -> Result<(), WriteBackError> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        let mut args = vec!["push", "--quiet"];
        if force {
            args.push("--force");
        }
        args.extend([remote, refspec.as_str()]);
        self.run("push", args).await.map(|_| ())
    }
}

/// Embed `username:token@` into an HTTP(S) URL; other schemes pass through.
fn with_token(url: &str, username: &str, token: &str) -> String {
    for scheme in ["https://", "http://"] {
        if let Some(rest) = url.strip_prefix(scheme) {
            return format!("{scheme}{username}:{token}@{rest}");
        }
    }
    url.to_owned()
}

/// `ref: refs/heads/main\tHEAD` -> `main`.
fn parse_symref(out: &str) -> Option<String> {
    out.lines().find_map(|line| {
        let rest = line.strip_prefix("ref:")?;
        let (reference, head) = rest.trim().split_once('\t')?;
        (head.trim() == "HEAD")
            .then(|| reference.trim().strip_prefix("refs/heads/"))
            .flatten()
            .map(str::to_owned)
    })
}
