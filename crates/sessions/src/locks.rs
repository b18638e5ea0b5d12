//! Per-key async locks for read-modify-write sequences on room state.
//!
//! Serializes work on one (owner, department) pair inside a process. It does
//! not coordinate separate processes sharing a database.

use std::sync::Arc;

use {
    dashmap::DashMap,
    tokio::sync::{Mutex, OwnedMutexGuard},
};

/// Idle entries are swept once the map grows past this.
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        if self.locks.len() > SWEEP_THRESHOLD {
            self.locks.retain(|_, m| Arc::strong_count(m) > 1);
        }
        let mutex = Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        mutex.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
