//! Attempt/success history used for scheduling, plus access to the shared
//! repository locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use tagpilot_core::types::{AppName, RepoUrl};
use tagpilot_sync::{RepoLock, RepoLocks};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    /// Consecutive failures; reset by a success.
    pub fail_count: u32,
}

/// Per-application run statistics.
///
/// The stats map and the repository lock registry use independent mutexes so
/// that recording a result never waits on lock-map growth.
#[derive(Debug, Default)]
pub struct RunState {
    stats: Mutex<HashMap<AppName, RunStats>>,
    repo_locks: Arc<RepoLocks>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A state sharing an existing lock registry (the one the write
    /// coordinator flushes under).
    pub fn with_repo_locks(repo_locks: Arc<RepoLocks>) -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
            repo_locks,
        }
    }

    pub fn record_attempt(&self, app: &AppName) -> DateTime<Utc> {
        let now = Utc::now();
        self.record_attempt_at(app, now);
        now
    }

    pub fn record_attempt_at(&self, app: &AppName, at: DateTime<Utc>) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.entry(app.clone()).or_default().last_attempt = Some(at);
    }

    pub fn record_result(&self, app: &AppName, failed: bool) -> DateTime<Utc> {
        let now = Utc::now();
        self.record_result_at(app, failed, now);
        now
    }

    pub fn record_result_at(&self, app: &AppName, failed: bool, at: DateTime<Utc>) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = stats.entry(app.clone()).or_default();
        if failed {
            entry.fail_count = entry.fail_count.saturating_add(1);
        } else {
            entry.last_success = Some(at);
            entry.fail_count = 0;
        }
    }

    pub fn stats(&self, app: &AppName) -> Option<RunStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app)
            .copied()
    }

    /// Owned copy of every app's stats.
    pub fn snapshot(&self) -> HashMap<AppName, RunStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn repository_lock(&self, repo: &RepoUrl) -> RepoLock {
        self.repo_locks.lock_for(repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn attempt_then_result_round_trip() {
        let state = RunState::new();
        let app = AppName::from("web");
        let t0 = Utc::now();

        state.record_attempt_at(&app, t0);
        state.record_result_at(&app, true, t0 + Duration::seconds(1));

        let snap = state.snapshot();
        let stats = snap.get(&app).copied().expect("stats");
        assert_eq!(stats.last_attempt, Some(t0));
        assert_eq!(stats.last_success, None);
        assert_eq!(stats.fail_count, 1);
        assert_eq!(state.stats(&app), Some(stats));
    }

    #[test]
    fn success_resets_fail_count() {
        let state = RunState::new();
        let app = AppName::from("web");
        let t0 = Utc::now();

        for _ in 0..3 {
            state.record_result_at(&app, true, t0);
        }
        assert_eq!(state.stats(&app).map(|s| s.fail_count), Some(3));

        state.record_result_at(&app, false, t0 + Duration::seconds(5));
        let stats = state.stats(&app).expect("stats");
        assert_eq!(stats.fail_count, 0);
        assert_eq!(stats.last_success, Some(t0 + Duration::seconds(5)));
    }

    #[test]
    fn failure_keeps_last_success() {
        let state = RunState::new();
        let app = AppName::from("x");

        state.record_attempt(&app);
        state.record_result(&app, false);
        let succeeded_at = state.stats(&app).and_then(|s| s.last_success).expect("success");

        state.record_attempt(&app);
        state.record_result(&app, true);
        let stats = state.stats(&app).expect("stats");
        assert_eq!(stats.last_success, Some(succeeded_at));
        assert!(succeeded_at <= Utc::now());
        assert_eq!(stats.fail_count, 1);
    }

    #[test]
    fn snapshot_is_detached() {
        let state = RunState::new();
        let app = AppName::from("web");
        state.record_attempt(&app);
        let snap = state.snapshot();
        state.record_result(&app, true);
        assert_eq!(snap.get(&app).map(|s| s.fail_count), Some(0));
    }

    #[test]
    fn repository_lock_shared_with_registry() {
        let locks = Arc::new(RepoLocks::new());
        let state = RunState::with_repo_locks(locks.clone());
        let repo = RepoUrl::from("https://git/a.git");
        assert!(Arc::ptr_eq(&state.repository_lock(&repo), &locks.lock_for(&repo)));
        assert_eq!(locks.len(), 1);
    }
}
