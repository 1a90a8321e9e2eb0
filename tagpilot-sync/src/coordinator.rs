//! Per-repository write coordination.
//!
//! Each repository gets one long-lived writer task, created on its first
//! intent. Writers batch intents and flush when `max_batch` intents are
//! queued, when `flush_every` has elapsed since the first unflushed intent,
//! or on shutdown. A flush holds the repository lock, resolves the remote's
//! default branch at most once, splits the batch by resolved branch and
//! credentials, and performs one add/commit/push per group.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tagpilot_core::types::{Credentials, RepoUrl};
use tagpilot_core::GitSettings;
use tagpilot_renderer::{CommitContext, CommitMessageRenderer};

use crate::error::{io_err, WriteBackError};
use crate::git::{
    default_branch, prepare_checkout, CheckoutPlan, CommitMessage, CommitOptions, GitClient,
    GitClientFactory,
};
use crate::intent::{WriteIntent, WriteOutcome};
use crate::locks::RepoLocks;
use crate::manifest::ApplyOutcome;

struct WriteJob {
    intent: WriteIntent,
    respond_to: oneshot::Sender<Result<WriteOutcome, String>>,
}

struct Writer {
    tx: mpsc::Sender<WriteJob>,
    handle: JoinHandle<()>,
}

/// State shared by every writer task.
struct FlushContext {
    settings: GitSettings,
    factory: Arc<dyn GitClientFactory>,
    locks: Arc<RepoLocks>,
    renderer: Arc<CommitMessageRenderer>,
}

pub struct WriteCoordinator {
    ctx: Arc<FlushContext>,
    writers: Mutex<HashMap<RepoUrl, Writer>>,
    shutdown: CancellationToken,
}

impl WriteCoordinator {
    pub fn new(
        settings: GitSettings,
        factory: Arc<dyn GitClientFactory>,
        locks: Arc<RepoLocks>,
        renderer: Arc<CommitMessageRenderer>,
    ) -> Self {
        Self {
            ctx: Arc::new(FlushContext {
                settings,
                factory,
                locks,
                renderer,
            }),
            writers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Queue `intent` on its repository's writer and wait for the flush result.
    pub async fn submit(&self, intent: WriteIntent) -> Result<WriteOutcome, WriteBackError> {
        if self.shutdown.is_cancelled() {
            return Err(WriteBackError::ShuttingDown);
        }
        let tx = self.sender_for(intent.repo());
        let (respond_to, rx) = oneshot::channel();
        tx.send(WriteJob { intent, respond_to })
            .await
            .map_err(|_| WriteBackError::ChannelClosed("write queue"))?;

        let outcome = rx
            .await
            .map_err(|_| WriteBackError::ChannelClosed("write response"))?;
        outcome.map_err(WriteBackError::Rejected)
    }

    /// Stop intake, flush everything queued and wait for every writer to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let writers: Vec<(RepoUrl, Writer)> = self
            .writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (repo, writer) in writers {
            drop(writer.tx);
            if let Err(err) = writer.handle.await {
                tracing::error!(repo = %repo, panicked = err.is_panic(), error = %err, "writer task failed");
            }
        }
    }

    /// Number of repositories with a live writer.
    pub fn writer_count(&self) -> usize {
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn sender_for(&self, repo: &RepoUrl) -> mpsc::Sender<WriteJob> {
        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(writer) = writers.get(repo) {
            if !writer.handle.is_finished() {
                return writer.tx.clone();
            }
        }
        let (tx, rx) = mpsc::channel(self.ctx.settings.queue_depth.max(1));
        let handle = tokio::spawn(writer_task(
            repo.clone(),
            rx,
            self.ctx.clone(),
            self.shutdown.clone(),
        ));
        tracing::debug!(repo = %repo, "spawned repository writer");
        writers.insert(
            repo.clone(),
            Writer {
                tx: tx.clone(),
                handle,
            },
        );
        tx
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

async fn writer_task(
    repo: RepoUrl,
    mut rx: mpsc::Receiver<WriteJob>,
    ctx: Arc<FlushContext>,
    shutdown: CancellationToken,
) {
    let max_batch = ctx.settings.max_batch.max(1);
    let flush_every: Option<Duration> = ctx.settings.flush_every();
    let mut batch: Vec<WriteJob> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            maybe_job = rx.recv() => {
                let Some(job) = maybe_job else { break };
                if batch.is_empty() {
                    deadline = flush_every.map(|d| Instant::now() + d);
                }
                batch.push(job);
                if batch.len() >= max_batch {
                    flush(&repo, std::mem::take(&mut batch), &ctx).await;
                    deadline = None;
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                flush(&repo, std::mem::take(&mut batch), &ctx).await;
                deadline = None;
            }
            _ = shutdown.cancelled() => {
                rx.close();
                while let Some(job) = rx.recv().await {
                    batch.push(job);
                }
                break;
            }
        }
    }

    if !batch.is_empty() {
        flush(&repo, batch, &ctx).await;
    }
    tracing::debug!(repo = %repo, "repository writer stopped");
}

/// Split `items` by key, preserving first-seen key order and item order
/// within each group.
pub fn group_in_order<T, K, F>(items: Vec<T>, key: F) -> Vec<(K, Vec<T>)>
where
    K: PartialEq,
    F: Fn(&T) -> K,
{
    let mut groups: Vec<(K, Vec<T>)> = Vec::new();
    for item in items {
        let k = key(&item);
        match groups.iter_mut().find(|(existing, _)| *existing == k) {
            Some((_, members)) => members.push(item),
            None => groups.push((k, vec![item])),
        }
    }
    groups
}

async fn flush(repo: &RepoUrl, jobs: Vec<WriteJob>, ctx: &FlushContext) {
    if jobs.is_empty() {
        return;
    }
    let lock = ctx.locks.lock_for(repo);
    let _guard = lock.lock().await;
    tracing::debug!(repo = %repo, intents = jobs.len(), "flushing write batch");

    let Some((default, jobs)) = resolve_default_branch(repo, jobs, ctx).await else {
        return;
    };

    // Intents resolving to the same branches share one commit; differing
    // credentials never share a clone.
    let keyed = jobs.into_iter().map(|job| {
        let plan = CheckoutPlan::resolve(&job.intent.write_back.branch, &default);
        (plan, job)
    });
    let groups = group_in_order(keyed.collect::<Vec<_>>(), |(plan, job)| {
        (plan.clone(), job.intent.write_back.credentials.clone())
    });
    for ((plan, credentials), members) in groups {
        let group = members.into_iter().map(|(_, job)| job).collect();
        flush_group(repo, &plan, &credentials, group, ctx).await;
    }
}

/// Look up the remote's default branch once if any intent needs it. On
/// failure those intents are answered with the error and the rest proceed;
/// `None` means nothing is left to flush.
async fn resolve_default_branch(
    repo: &RepoUrl,
    jobs: Vec<WriteJob>,
    ctx: &FlushContext,
) -> Option<(String, Vec<WriteJob>)> {
    let needs_default = |job: &WriteJob| job.intent.write_back.branch.needs_default_branch();
    let Some(first) = jobs.iter().find(|job| needs_default(*job)) else {
        return Some((String::new(), jobs));
    };

    let lookup = match ctx.factory.create(repo, &first.intent.write_back.credentials) {
        Ok(client) => default_branch(client.as_ref()).await,
        Err(err) => Err(err),
    };
    match lookup {
        Ok(branch) => {
            tracing::debug!(repo = %repo, branch = %branch, "resolved remote default branch");
            Some((branch, jobs))
        }
        Err(err) => {
            tracing::error!(repo = %repo, error = %err, "cannot resolve remote default branch");
            let (failed, rest): (Vec<_>, Vec<_>) = jobs.into_iter().partition(|job| needs_default(job));
            fail_all(failed, &err.to_string());
            (!rest.is_empty()).then(|| (String::new(), rest))
        }
    }
}

fn fail_all<I>(jobs: I, message: &str)
where
    I: IntoIterator<Item = WriteJob>,
{
    for job in jobs {
        let _ = job.respond_to.send(Err(message.to_owned()));
    }
}

async fn flush_group(
    repo: &RepoUrl,
    plan: &CheckoutPlan,
    credentials: &Credentials,
    group: Vec<WriteJob>,
    ctx: &FlushContext,
) {
    let client = match ctx.factory.create(repo, credentials) {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(repo = %repo, branch = %plan.push, error = %err, "git client setup failed");
            return fail_all(group, &err.to_string());
        }
    };
    if let Err(err) = prepare_checkout(client.as_ref(), plan).await {
        tracing::error!(repo = %repo, branch = %plan.checkout, error = %err, "checkout failed");
        return fail_all(group, &err.to_string());
    }

    // Edits run in arrival order; a failing edit only fails its own intent.
    let root = client.root().to_path_buf();
    let mut applied: Vec<(WriteJob, ApplyOutcome)> = Vec::with_capacity(group.len());
    for job in group {
        let edit = job.intent.edit.clone();
        let changes = job.intent.changes.clone();
        let edit_root = root.clone();
        let result = tokio::task::spawn_blocking(move || edit.apply(&edit_root, &changes))
            .await
            .map_err(WriteBackError::from)
            .and_then(|r| r);
        match result {
            Ok(outcome) => applied.push((job, outcome)),
            Err(err) => {
                tracing::warn!(repo = %repo, app = %job.intent.app, error = %err, "manifest edit failed");
                let _ = job.respond_to.send(Err(err.to_string()));
            }
        }
    }

    let mut changed_paths: Vec<PathBuf> = Vec::new();
    for (_, outcome) in applied.iter().filter(|(_, o)| o.changed) {
        if !changed_paths.contains(&outcome.path) {
            changed_paths.push(outcome.path.clone());
        }
    }
    if changed_paths.is_empty() {
        tracing::info!(repo = %repo, branch = %plan.push, "no manifest changes, skipping commit");
        for (job, _) in applied {
            let _ = job.respond_to.send(Ok(WriteOutcome::Unchanged));
        }
        return;
    }

    if let Err(err) = commit_and_push(client.as_ref(), repo, plan, &applied, &changed_paths, ctx).await {
        tracing::error!(repo = %repo, branch = %plan.push, error = %err, "commit/push failed");
        return fail_all(applied.into_iter().map(|(job, _)| job), &err.to_string());
    }

    tracing::info!(
        repo = %repo,
        branch = %plan.push,
        files = changed_paths.len(),
        intents = applied.len(),
        "pushed image updates",
    );
    for (job, outcome) in applied {
        let reply = if outcome.changed {
            WriteOutcome::Committed {
                branch: plan.push.clone(),
            }
        } else {
            WriteOutcome::Unchanged
        };
        let _ = job.respond_to.send(Ok(reply));
    }
}

async fn commit_and_push(
    client: &dyn GitClient,
    repo: &RepoUrl,
    plan: &CheckoutPlan,
    applied: &[(WriteJob, ApplyOutcome)],
    changed_paths: &[PathBuf],
    ctx: &FlushContext,
) -> Result<(), WriteBackError> {
    let mut commit_ctx = CommitContext::new(repo.0.clone(), plan.push.clone());
    for (job, _) in applied.iter().filter(|(_, o)| o.changed) {
        commit_ctx.push_app(&job.intent.app, &job.intent.changes);
    }
    let message = ctx.renderer.render(&commit_ctx)?;

    let message_file = tokio::task::spawn_blocking(move || -> Result<_, WriteBackError> {
        let mut file = tempfile::Builder::new()
            .prefix("tagpilot-commit-")
            .tempfile()
            .map_err(|e| io_err(std::env::temp_dir(), e))?;
        file.write_all(message.as_bytes())
            .map_err(|e| io_err(file.path(), e))?;
        Ok(file)
    })
    .await??;

    let opts = CommitOptions {
        message: CommitMessage::Path(message_file.path().to_path_buf()),
        signing_key: ctx.settings.signing_key.clone(),
        signing_method: ctx.settings.signing_method,
        sign_off: ctx.settings.sign_off,
    };
    client.add(changed_paths).await?;
    client.commit(changed_paths, &opts).await?;
    client.push("origin", &plan.push, plan.force).await?;
    Ok(())
}
