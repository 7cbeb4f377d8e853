use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-source run locks.
///
/// Merge and recovery are the only store mutators; both hold the lock of the
/// source they touch, so they never interleave. The switch coordinator holds the
/// locks of both sources it switches between.
#[derive(Debug, Default)]
pub struct SourceLocks {
    locks: Mutex<HashMap<&'static str, Arc<AsyncMutex<()>>>>,
}

pub type RunGuard = OwnedMutexGuard<()>;

impl SourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, source_id: &'static str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(source_id).or_default())
    }

    pub async fn lock(&self, source_id: &'static str) -> RunGuard {
        self.entry(source_id).lock_owned().await
    }

    /// Lock two sources in id order so two callers never wait on each other.
    /// Locking the same source twice yields a single guard.
    pub async fn lock_pair(&self, a: &'static str, b: &'static str) -> (RunGuard, Option<RunGuard>) {
        if a == b {
            return (self.lock(a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.lock(first).await;
        let second = self.lock(second).await;
        (first, Some(second))
    }

    pub fn is_locked(&self, source_id: &'static str) -> bool {
        self.entry(source_id).try_lock().is_err()
    }
}
