//! Process-local advisory locks keyed by account ID.
//!
//! Held around read-then-decide-then-spend sequences on shared external
//! balances. The guard unlocks on drop, on every return path, and removes
//! the key's entry once nobody else holds or waits for it.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type LockMap = DashMap<String, Arc<Mutex<()>>>;

#[derive(Debug, Default, Clone)]
pub struct KeyedLocks {
    locks: Arc<LockMap>,
}

#[derive(Debug)]
pub struct KeyedGuard {
    key: String,
    locks: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        // Unlock first so the guard's own reference is gone
        drop(self.guard.take());
        // Waiters hold a clone of the mutex, which keeps the entry alive
        let removed = self
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1)
            .is_some();
        if removed {
            trace!(key = %self.key, "Evicted idle keyed lock");
        }
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn guard(&self, key: &str, guard: OwnedMutexGuard<()>) -> KeyedGuard {
        KeyedGuard {
            key: key.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let mutex = self.mutex(key);
        trace!(key = %key, "Acquiring keyed lock");
        let guard = mutex.lock_owned().await;
        self.guard(key, guard)
    }

    pub fn try_lock(&self, key: &str) -> Option<KeyedGuard> {
        let mutex = self.mutex(key);
        match mutex.clone().try_lock_owned() {
            Ok(guard) => Some(self.guard(key, guard)),
            Err(_) => {
                // Dropping our clone may leave the entry idle
                drop(mutex);
                self.locks.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
                None
            }
        }
    }

    /// Number of keys currently locked or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
