//! Bounded-concurrency fan-out of per-application work.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tagpilot_core::types::{AppName, Application, RepoUrl};

use crate::ports::{Observer, SkipReason};
use crate::run_state::{RunState, RunStats};

/// Auto concurrency is this many workers per CPU, capped by the due count.
pub const WORKERS_PER_CPU: usize = 8;

/// `configured` wins when non-zero; 0 means `min(cpus * 8, due)`. Never below 1.
pub fn resolve_concurrency(configured: usize, due: usize, cpus: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    cpus.saturating_mul(WORKERS_PER_CPU).min(due).max(1)
}

/// Continuous-mode gate: never attempted, or attempted at least `interval` ago.
pub fn is_due(stats: Option<&RunStats>, interval: Duration, now: DateTime<Utc>) -> bool {
    let Some(last) = stats.and_then(|s| s.last_attempt) else {
        return true;
    };
    match chrono::Duration::from_std(interval) {
        Ok(interval) => now - last >= interval,
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassResult {
    pub applications_processed: usize,
    pub images_considered: usize,
    pub images_updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Per-pass counters, safe to bump from every worker concurrently.
#[derive(Debug, Default)]
pub struct PassCounters {
    processed: AtomicUsize,
    images_considered: AtomicUsize,
    images_updated: AtomicUsize,
    skipped: AtomicUsize,
    errors: AtomicUsize,
}

impl PassCounters {
    pub fn record(&self, result: &AppResult) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.images_considered
            .fetch_add(result.images_considered, Ordering::Relaxed);
        self.images_updated
            .fetch_add(result.images_updated, Ordering::Relaxed);
        self.errors.fetch_add(result.errors, Ordering::Relaxed);
    }

    pub fn skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PassResult {
        PassResult {
            applications_processed: self.processed.load(Ordering::Relaxed),
            images_considered: self.images_considered.load(Ordering::Relaxed),
            images_updated: self.images_updated.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Work seam
// ---------------------------------------------------------------------------

/// Per-application outcome returned by a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppResult {
    pub images_considered: usize,
    pub images_updated: usize,
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct PassContext {
    pub state: Arc<RunState>,
    pub dry_run: bool,
}

#[async_trait]
pub trait AppWork: Send + Sync {
    async fn run(&self, app: Application, ctx: PassContext) -> AppResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    pub concurrency: usize,
    /// 0 means unlimited.
    pub per_repo_cap: usize,
    pub dry_run: bool,
}

// ---------------------------------------------------------------------------
// In-flight set
// ---------------------------------------------------------------------------

/// Names of apps with a dispatch still running (continuous mode).
#[derive(Debug, Default, Clone)]
pub struct InFlight {
    inner: Arc<Mutex<HashSet<AppName>>>,
}

/// Removes its app from the [`InFlight`] set when dropped, including while
/// unwinding from a panicking worker.
#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<Mutex<HashSet<AppName>>>,
    app: AppName,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `app`; `None` if it is already in flight.
    pub fn try_claim(&self, app: &AppName) -> Option<InFlightGuard> {
        let mut set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(app.clone()) {
            return None;
        }
        Some(InFlightGuard {
            inner: self.inner.clone(),
            app: app.clone(),
        })
    }

    pub fn contains(&self, app: &AppName) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(app)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.app);
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    work: Arc<dyn AppWork>,
    observer: Arc<dyn Observer>,
}

/// Spawned workers of one pass, joined by [`Dispatcher::join`].
pub struct PassHandles {
    counters: Arc<PassCounters>,
    state: Arc<RunState>,
    handles: Vec<(AppName, JoinHandle<()>)>,
}

impl PassHandles {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Dispatcher {
    pub fn new(work: Arc<dyn AppWork>, observer: Arc<dyn Observer>) -> Self {
        Self { work, observer }
    }

    /// Dispatch `apps` in order and wait for every worker.
    ///
    /// Slots are acquired before spawning, so dispatch order follows input
    /// order. Cancellation while waiting for a slot skips the remaining apps.
    pub async fn run_pass(
        &self,
        apps: Vec<Application>,
        state: Arc<RunState>,
        opts: DispatchOptions,
        cancel: &CancellationToken,
    ) -> PassResult {
        let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
        let counters = Arc::new(PassCounters::default());
        let mut handles = Vec::with_capacity(apps.len());
        let mut repo_counts: HashMap<RepoUrl, usize> = HashMap::new();

        for app in apps {
            if !self.within_repo_cap(&app, opts.per_repo_cap, &mut repo_counts, &counters) {
                continue;
            }
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                self.skip_cancelled(&app.name, &counters);
                continue;
            };
            let name = app.name.clone();
            let handle = self.spawn_worker(app, permit, &state, opts.dry_run, &counters);
            handles.push((name, handle));
        }

        self.join(PassHandles {
            counters,
            state,
            handles,
        })
        .await
    }

    /// Spawn `apps` without waiting for slots or completion (continuous
    /// mode). Each worker acquires its slot from the shared `semaphore` and
    /// holds its [`InFlightGuard`] until it finishes.
    pub fn spawn_pass(
        &self,
        apps: Vec<(Application, InFlightGuard)>,
        state: Arc<RunState>,
        semaphore: Arc<Semaphore>,
        opts: DispatchOptions,
        cancel: &CancellationToken,
    ) -> PassHandles {
        let counters = Arc::new(PassCounters::default());
        let mut handles = Vec::with_capacity(apps.len());
        let mut repo_counts: HashMap<RepoUrl, usize> = HashMap::new();

        for (app, guard) in apps {
            if !self.within_repo_cap(&app, opts.per_repo_cap, &mut repo_counts, &counters) {
                continue;
            }
            let name = app.name.clone();
            let work = self.work.clone();
            let observer = self.observer.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let ctx = PassContext {
                state: state.clone(),
                dry_run: opts.dry_run,
            };
            let task_counters = counters.clone();
            let handle = tokio::spawn(async move {
                let _guard = guard;
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    task_counters.skip();
                    task_counters.error();
                    observer.app_skipped(&app.name, SkipReason::Cancelled);
                    return;
                };
                let result = work.run(app, ctx).await;
                task_counters.record(&result);
            });
            handles.push((name, handle));
        }

        PassHandles {
            counters,
            state,
            handles,
        }
    }

    /// Join every worker of a pass. A panicked worker counts as processed and
    /// failed, and its app records a failure.
    pub async fn join(&self, pass: PassHandles) -> PassResult {
        let PassHandles {
            counters,
            state,
            handles,
        } = pass;
        for (app, handle) in handles {
            if let Err(err) = handle.await {
                counters.processed();
                counters.error();
                if err.is_panic() {
                    state.record_result(&app, true);
                    tracing::error!(app = %app, "update worker panicked");
                } else {
                    tracing::warn!(app = %app, error = %err, "update worker did not complete");
                }
            }
        }
        counters.snapshot()
    }

    fn within_repo_cap(
        &self,
        app: &Application,
        cap: usize,
        repo_counts: &mut HashMap<RepoUrl, usize>,
        counters: &PassCounters,
    ) -> bool {
        let Some(repo) = app.repo_url() else {
            return true;
        };
        if cap == 0 {
            return true;
        }
        let count = repo_counts.entry(repo.clone()).or_insert(0);
        if *count >= cap {
            counters.skip();
            self.observer.app_skipped(&app.name, SkipReason::RepoCap);
            tracing::debug!(app = %app.name, repo = %repo, cap, "per-repository cap reached, skipping");
            return false;
        }
        *count += 1;
        true
    }

    fn skip_cancelled(&self, app: &AppName, counters: &PassCounters) {
        counters.skip();
        counters.error();
        self.observer.app_skipped(app, SkipReason::Cancelled);
        tracing::debug!(app = %app, "dispatch cancelled, skipping");
    }

    fn spawn_worker(
        &self,
        app: Application,
        permit: OwnedSemaphorePermit,
        state: &Arc<RunState>,
        dry_run: bool,
        counters: &Arc<PassCounters>,
    ) -> JoinHandle<()> {
        let work = self.work.clone();
        let counters = counters.clone();
        let ctx = PassContext {
            state: state.clone(),
            dry_run,
        };
        tokio::spawn(async move {
            let _permit = permit;
            let result = work.run(app, ctx).await;
            counters.record(&result);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::NoopObserver;
    use tagpilot_core::types::{BranchSpec, Credentials, GitWriteBack, SourceKind, WriteBackConfig, WriteBackTarget};

    #[test]
    fn auto_concurrency_is_bounded_by_due_apps() {
        assert_eq!(resolve_concurrency(0, 3, 8), 3);
        assert_eq!(resolve_concurrency(0, 500, 2), 16);
        assert_eq!(resolve_concurrency(0, 0, 4), 1);
        assert_eq!(resolve_concurrency(5, 500, 64), 5);
    }

    #[test]
    fn due_gate() {
        let now = Utc::now();
        assert!(is_due(None, Duration::from_secs(60), now));
        let recent = RunStats {
            last_attempt: Some(now - chrono::Duration::seconds(10)),
            ..RunStats::default()
        };
        assert!(!is_due(Some(&recent), Duration::from_secs(60), now));
        assert!(is_due(Some(&recent), Duration::from_secs(10), now));
    }

    #[test]
    fn guard_releases_on_drop_and_blocks_double_claim() {
        let in_flight = InFlight::new();
        let app = AppName::from("web");
        let guard = in_flight.try_claim(&app).expect("claim");
        assert!(in_flight.try_claim(&app).is_none());
        assert!(in_flight.contains(&app));
        drop(guard);
        assert!(in_flight.is_empty());
    }

    #[test]
    fn guard_releases_during_unwind() {
        let in_flight = InFlight::new();
        let app = AppName::from("web");
        let cloned = in_flight.clone();
        let claim = app.clone();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = cloned.try_claim(&claim).expect("claim");
            panic!("worker blew up");
        }));
        assert!(outcome.is_err());
        assert!(!in_flight.contains(&app));
    }

    struct Panicky;

    #[async_trait]
    impl AppWork for Panicky {
        async fn run(&self, app: Application, _ctx: PassContext) -> AppResult {
            if app.name.0 == "boom" {
                panic!("boom");
            }
            AppResult {
                images_considered: 1,
                ..AppResult::default()
            }
        }
    }

    fn git_app(name: &str, repo: &str) -> Application {
        let mut app = Application::new(name, SourceKind::Kustomize);
        app.write_back = WriteBackConfig::Git(GitWriteBack {
            repo_url: RepoUrl::from(repo),
            branch: BranchSpec::new("main"),
            credentials: Credentials::Anonymous,
            target: WriteBackTarget::SourceOverride,
        });
        app
    }

    fn opts(concurrency: usize, per_repo_cap: usize) -> DispatchOptions {
        DispatchOptions {
            concurrency,
            per_repo_cap,
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn panicking_worker_is_counted_and_recorded() {
        let dispatcher = Dispatcher::new(Arc::new(Panicky), Arc::new(NoopObserver));
        let state = Arc::new(RunState::new());
        let apps = vec![
            Application::new("ok", SourceKind::Kustomize),
            Application::new("boom", SourceKind::Kustomize),
        ];

        let result = dispatcher
            .run_pass(apps, state.clone(), opts(2, 0), &CancellationToken::new())
            .await;

        assert_eq!(result.applications_processed, 2);
        assert_eq!(result.errors, 1);
        assert_eq!(result.images_considered, 1);
        assert_eq!(state.stats(&AppName::from("boom")).map(|s| s.fail_count), Some(1));
    }

    #[tokio::test]
    async fn per_repo_cap_skips_without_error() {
        let dispatcher = Dispatcher::new(Arc::new(Panicky), Arc::new(NoopObserver));
        let apps = vec![
            git_app("a1", "https://git/a.git"),
            git_app("a2", "https://git/a.git"),
            git_app("a3", "https://git/a.git"),
            git_app("b1", "https://git/b.git"),
            Application::new("api-only", SourceKind::Helm),
        ];

        let result = dispatcher
            .run_pass(apps, Arc::new(RunState::new()), opts(4, 1), &CancellationToken::new())
            .await;

        assert_eq!(result.applications_processed, 3);
        assert_eq!(result.skipped, 2);
        assert_eq!(result.errors, 0);
    }

    #[tokio::test]
    async fn cancelled_dispatch_counts_skip_and_error() {
        let dispatcher = Dispatcher::new(Arc::new(Panicky), Arc::new(NoopObserver));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let apps = vec![
            Application::new("x", SourceKind::Kustomize),
            Application::new("y", SourceKind::Kustomize),
        ];

        let result = dispatcher
            .run_pass(apps, Arc::new(RunState::new()), opts(1, 0), &cancel)
            .await;

        assert_eq!(result.applications_processed, 0);
        assert_eq!(result.skipped, 2);
        assert_eq!(result.errors, 2);
    }

    #[tokio::test]
    async fn spawned_pass_releases_in_flight_after_panic() {
        let dispatcher = Dispatcher::new(Arc::new(Panicky), Arc::new(NoopObserver));
        let in_flight = InFlight::new();
        let boom = Application::new("boom", SourceKind::Kustomize);
        let guard = in_flight.try_claim(&boom.name).expect("claim");

        let handles = dispatcher.spawn_pass(
            vec![(boom, guard)],
            Arc::new(RunState::new()),
            Arc::new(Semaphore::new(1)),
            opts(1, 0),
            &CancellationToken::new(),
        );
        assert_eq!(handles.len(), 1);
        let result = dispatcher.join(handles).await;

        assert_eq!(result.errors, 1);
        assert!(in_flight.is_empty());
    }
}
