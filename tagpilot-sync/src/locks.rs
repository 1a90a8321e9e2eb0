//! Per-repository async locks.
//!
//! At most one checkout/commit/push runs per repository at a time, whatever
//! the branch. Entries are created on first use and never evicted, which keeps
//! lock identity stable for the life of the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tagpilot_core::types::RepoUrl;

pub type RepoLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Default)]
pub struct RepoLocks {
    inner: Mutex<HashMap<RepoUrl, RepoLock>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `repo`, created if absent.
    pub fn lock_for(&self, repo: &RepoUrl) -> RepoLock {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(repo.clone()).or_default().clone()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_repo_returns_same_lock() {
        let locks = RepoLocks::new();
        let a = locks.lock_for(&RepoUrl::from("https://git/a.git"));
        let again = locks.lock_for(&RepoUrl::from("https://git/a.git"));
        let b = locks.lock_for(&RepoUrl::from("https://git/b.git"));

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn lock_is_exclusive_per_repo() {
        let locks = RepoLocks::new();
        let repo = RepoUrl::from("https://git/a.git");
        let held = locks.lock_for(&repo);
        let _guard = held.lock().await;

        assert!(locks.lock_for(&repo).try_lock().is_err());
        assert!(locks
            .lock_for(&RepoUrl::from("https://git/b.git"))
            .try_lock()
            .is_ok());
    }
}
