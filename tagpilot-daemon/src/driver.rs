//! Cycle and continuous drivers.
//!
//! Cycle mode runs one full pass every `check_interval` (passes never
//! overlap). Continuous mode ticks every second and dispatches each app as
//! soon as it is due, without waiting for earlier dispatches to finish.
//! With `check_interval == 0` either mode runs a single pass and returns.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tagpilot_core::types::Application;
use tagpilot_core::{RunMode, UpdaterConfig};
use tagpilot_renderer::CommitMessageRenderer;
use tagpilot_sync::{RepoLocks, WriteCoordinator};

use crate::dispatcher::{is_due, resolve_concurrency, DispatchOptions, Dispatcher, PassResult};
use crate::dispatcher::InFlight;
use crate::error::EngineError;
use crate::ports::{Collaborators, PassKind, SkipReason};
use crate::run_state::RunState;
use crate::selector::ApplicationSelector;
use crate::worker::UpdateWorker;

/// Granularity of the outer loop in both modes.
pub const TICK: Duration = Duration::from_secs(1);

pub struct Driver {
    config: UpdaterConfig,
    collab: Collaborators,
    selector: ApplicationSelector,
    dispatcher: Arc<Dispatcher>,
    coordinator: Arc<WriteCoordinator>,
    locks: Arc<RepoLocks>,
    cpus: usize,
}

impl Driver {
    /// Validate `config` and wire the engine. Fatal configuration problems,
    /// including a broken commit template, surface here before any dispatch.
    pub fn new(config: UpdaterConfig, collab: Collaborators) -> Result<Self, EngineError> {
        config.validate()?;
        let renderer = CommitMessageRenderer::new(config.git.commit_message_template.as_deref())?;
        let locks = Arc::new(RepoLocks::new());
        let coordinator = Arc::new(WriteCoordinator::new(
            config.git.clone(),
            collab.git.clone(),
            locks.clone(),
            Arc::new(renderer),
        ));
        let worker = UpdateWorker::new(
            collab.resolver.clone(),
            collab.orchestrator.clone(),
            coordinator.clone(),
            collab.observer.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(worker), collab.observer.clone()));
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Ok(Self {
            selector: ApplicationSelector::new(config.schedule, config.cooldown()),
            config,
            collab,
            dispatcher,
            coordinator,
            locks,
            cpus,
        })
    }

    /// Override the CPU count used for auto concurrency.
    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus.max(1);
        self
    }

    pub fn coordinator(&self) -> &Arc<WriteCoordinator> {
        &self.coordinator
    }

    /// A continuous-mode scheduler sharing this driver's repository locks.
    pub fn continuous_scheduler(&self) -> ContinuousScheduler {
        ContinuousScheduler::new(self.locks.clone())
    }

    /// Run until `stop` fires, the health monitor reports a fatal error, or
    /// (with `check_interval == 0`) after one pass. The write
    /// coordinator is drained before returning.
    pub async fn run(&self, stop: CancellationToken) -> Result<(), EngineError> {
        tracing::info!(
            mode = ?self.config.mode,
            interval_secs = self.config.check_interval_secs,
            schedule = ?self.config.schedule,
            dry_run = self.config.dry_run,
            "starting image updater",
        );
        let result = self.run_modes(&stop).await;
        self.coordinator.shutdown().await;
        tracing::info!("image updater stopped");
        result
    }

    async fn run_modes(&self, stop: &CancellationToken) -> Result<(), EngineError> {
        if self.config.warm_up && !stop.is_cancelled() {
            if let Err(err) = self.warm_up(stop).await {
                tracing::warn!(error = %err, "warm-up pass failed");
            }
        }
        match self.config.mode {
            RunMode::Cycle => self.run_cycles(stop).await,
            RunMode::Continuous => {
                let mut scheduler = ContinuousScheduler::new(self.locks.clone());
                let result = self.run_continuous(&mut scheduler, stop).await;
                scheduler.drain().await;
                result
            }
        }
    }

    fn check_health(&self) -> Result<(), EngineError> {
        match self.collab.health.fatal_error() {
            Some(reason) => {
                tracing::error!(reason = %reason, "health monitor reported a fatal condition");
                Err(EngineError::Unhealthy(reason))
            }
            None => Ok(()),
        }
    }

    /// Sleep one tick; `false` if `stop` fired first.
    async fn tick(stop: &CancellationToken) -> bool {
        tokio::select! {
            _ = stop.cancelled() => false,
            _ = tokio::time::sleep(TICK) => true,
        }
    }

    // -----------------------------------------------------------------------
    // Passes
    // -----------------------------------------------------------------------

    async fn eligible_applications(&self) -> Result<Vec<Application>, EngineError> {
        let apps = self
            .collab
            .orchestrator
            .list_applications(self.config.label_selector.as_deref())
            .await?;
        Ok(self
            .collab
            .orchestrator
            .filter_applications_for_update(apps, &self.config.app_name_patterns))
    }

    /// One dry-run pass at concurrency 1, reported only as warm-up completion.
    pub async fn warm_up(&self, stop: &CancellationToken) -> Result<PassResult, EngineError> {
        let apps = self.eligible_applications().await?;
        let state = Arc::new(RunState::with_repo_locks(self.locks.clone()));
        let opts = DispatchOptions {
            concurrency: 1,
            per_repo_cap: self.config.per_repo_cap,
            dry_run: true,
        };
        let result = self.dispatcher.run_pass(apps, state, opts, stop).await;
        tracing::info!(
            processed = result.applications_processed,
            images = result.images_considered,
            "warm-up pass completed",
        );
        self.collab.observer.warm_up_completed();
        Ok(result)
    }

    /// One full cycle pass with a fresh [`RunState`].
    pub async fn run_pass(&self, stop: &CancellationToken) -> Result<PassResult, EngineError> {
        let apps = self.eligible_applications().await?;
        let state = Arc::new(RunState::with_repo_locks(self.locks.clone()));
        let ordered = self
            .selector
            .order(apps, |app| &app.name, &state.snapshot(), Utc::now());
        let opts = DispatchOptions {
            concurrency: resolve_concurrency(
                self.config.concurrency().unwrap_or(0),
                ordered.len(),
                self.cpus,
            ),
            per_repo_cap: self.config.per_repo_cap,
            dry_run: self.config.dry_run,
        };

        self.collab.observer.pass_started(PassKind::Cycle);
        let started = Instant::now();
        let result = self.dispatcher.run_pass(ordered, state, opts, stop).await;
        let elapsed = started.elapsed();
        log_summary(PassKind::Cycle, &result, elapsed, opts.concurrency);
        self.collab
            .observer
            .pass_finished(PassKind::Cycle, elapsed, &result);
        Ok(result)
    }

    async fn run_cycles(&self, stop: &CancellationToken) -> Result<(), EngineError> {
        let interval = self.config.check_interval();
        let mut last_end: Option<Instant> = None;
        loop {
            if stop.is_cancelled() {
                return Ok(());
            }
            self.check_health()?;

            let due = last_end.map_or(true, |end| end.elapsed() >= interval);
            if due {
                if let Err(err) = self.run_pass(stop).await {
                    tracing::error!(error = %err, "update pass failed");
                }
                last_end = Some(Instant::now());
                if interval.is_zero() {
                    return Ok(());
                }
            }
            if !Self::tick(stop).await {
                return Ok(());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Continuous
    // -----------------------------------------------------------------------

    async fn run_continuous(
        &self,
        scheduler: &mut ContinuousScheduler,
        stop: &CancellationToken,
    ) -> Result<(), EngineError> {
        loop {
            if stop.is_cancelled() {
                return Ok(());
            }
            self.check_health()?;
            if let Err(err) = self.continuous_tick(scheduler, stop).await {
                tracing::error!(error = %err, "continuous dispatch failed");
            }
            if self.config.check_interval().is_zero() {
                scheduler.drain().await;
                return Ok(());
            }
            if !Self::tick(stop).await {
                return Ok(());
            }
        }
    }

    /// Refresh the app list when stale, then dispatch every due app that is
    /// not already in flight.
    pub async fn continuous_tick(
        &self,
        scheduler: &mut ContinuousScheduler,
        stop: &CancellationToken,
    ) -> Result<usize, EngineError> {
        let interval = self.config.check_interval();
        let refresh_due = scheduler
            .last_refresh
            .map_or(true, |at| at.elapsed() >= interval);
        if refresh_due {
            scheduler.known = self.eligible_applications().await?;
            scheduler.last_refresh = Some(Instant::now());
        }
        scheduler.reap();

        let now = Utc::now();
        let stats = scheduler.state.snapshot();
        let mut due = Vec::new();
        for app in &scheduler.known {
            if !is_due(stats.get(&app.name), interval, now) {
                continue;
            }
            if scheduler.in_flight.contains(&app.name) {
                self.collab
                    .observer
                    .app_skipped(&app.name, SkipReason::InFlight);
                continue;
            }
            due.push(app.clone());
        }
        if due.is_empty() {
            return Ok(0);
        }

        let ordered = self.selector.order(due, |app| &app.name, &stats, now);
        let wanted = resolve_concurrency(
            self.config.concurrency().unwrap_or(0),
            ordered.len(),
            self.cpus,
        );
        scheduler.grow(wanted);

        let claimed: Vec<_> = ordered
            .into_iter()
            .filter_map(|app| {
                let guard = scheduler.in_flight.try_claim(&app.name)?;
                Some((app, guard))
            })
            .collect();
        let count = claimed.len();
        let opts = DispatchOptions {
            concurrency: scheduler.capacity,
            per_repo_cap: self.config.per_repo_cap,
            dry_run: self.config.dry_run,
        };

        self.collab.observer.pass_started(PassKind::Continuous);
        let started = Instant::now();
        let handles = self.dispatcher.spawn_pass(
            claimed,
            scheduler.state.clone(),
            scheduler.semaphore.clone(),
            opts,
            stop,
        );
        let dispatcher = self.dispatcher.clone();
        let observer = self.collab.observer.clone();
        scheduler.joiners.push(tokio::spawn(async move {
            let result = dispatcher.join(handles).await;
            let elapsed = started.elapsed();
            log_summary(PassKind::Continuous, &result, elapsed, opts.concurrency);
            observer.pass_finished(PassKind::Continuous, elapsed, &result);
        }));
        Ok(count)
    }
}

fn log_summary(kind: PassKind, result: &PassResult, elapsed: Duration, concurrency: usize) {
    tracing::info!(
        kind = ?kind,
        processed = result.applications_processed,
        considered = result.images_considered,
        updated = result.images_updated,
        skipped = result.skipped,
        errors = result.errors,
        concurrency,
        duration_ms = elapsed.as_millis() as u64,
        "update pass finished",
    );
}

// ---------------------------------------------------------------------------
// ContinuousScheduler
// ---------------------------------------------------------------------------

/// Process-lifetime state of continuous mode.
pub struct ContinuousScheduler {
    pub state: Arc<RunState>,
    pub in_flight: InFlight,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    known: Vec<Application>,
    last_refresh: Option<Instant>,
    joiners: Vec<JoinHandle<()>>,
}

impl ContinuousScheduler {
    pub fn new(locks: Arc<RepoLocks>) -> Self {
        Self {
            state: Arc::new(RunState::with_repo_locks(locks)),
            in_flight: InFlight::new(),
            semaphore: Arc::new(Semaphore::new(0)),
            capacity: 0,
            known: Vec::new(),
            last_refresh: None,
            joiners: Vec::new(),
        }
    }

    /// Current number of dispatch slots. Only ever grows.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn grow(&mut self, wanted: usize) {
        if wanted > self.capacity {
            self.semaphore.add_permits(wanted - self.capacity);
            self.capacity = wanted;
        }
    }

    fn reap(&mut self) {
        self.joiners.retain(|handle| !handle.is_finished());
    }

    /// Wait for every outstanding dispatch to finish and be accounted.
    pub async fn drain(&mut self) {
        for handle in self.joiners.drain(..) {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "continuous pass joiner failed");
            }
        }
    }
}
