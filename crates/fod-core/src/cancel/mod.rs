//! Shared queued-id sets.
//!
//! One set per operation type holds the ids currently in `queued`. The
//! scheduler rebuilds each set from the database every pass, which is how
//! manager-originated cancellations become visible; a worker must win the
//! atomic test-and-remove on its id before touching I/O, and a missing id
//! means the task was cancelled out from under it.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Mutex-guarded ordered set of queued task ids.
#[derive(Debug, Default)]
pub struct QueuedIdSet {
    inner: Mutex<BTreeSet<i64>>,
}

impl QueuedIdSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<i64>> {
        // Plain data; a poisoned guard is still a consistent set.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an id (pool submission path).
    pub fn insert(&self, id: i64) {
        self.lock().insert(id);
    }

    /// Atomically remove `id`, reporting whether it was present.
    ///
    /// This is the worker's cancel gate: `false` means the task is no
    /// longer queued and must not run.
    pub fn try_remove(&self, id: i64) -> bool {
        self.lock().remove(&id)
    }

    /// Replace the whole set with the database's view (scheduler refresh).
    pub fn replace(&self, ids: impl IntoIterator<Item = i64>) {
        let mut inner = self.lock();
        inner.clear();
        inner.extend(ids);
    }

    /// Whether `id` is currently queued.
    #[must_use]
    pub fn contains(&self, id: i64) -> bool {
        self.lock().contains(&id)
    }

    /// Number of queued ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current ids, ordered.
    #[must_use]
    pub fn snapshot(&self) -> Vec<i64> {
        self.lock().iter().copied().collect()
    }
}
