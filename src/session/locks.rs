//! Session Lock Registry
//!
//! One mutex per session id, created on first use and reclaimed once no
//! caller holds or waits on it. Guards are owned (`ArcMutexGuard`) so they
//! can outlive the registry shard lock they were looked up under.

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::sync::Arc;

/// Exclusive hold on one session
pub type SessionGuard = ArcMutexGuard<RawMutex, ()>;

#[derive(Default)]
pub struct LockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the session's mutex is held.
    pub fn lock(&self, session_id: &str) -> SessionGuard {
        let mutex = self.mutex_for(session_id);
        mutex.lock_arc()
    }

    /// Acquire without blocking, if the session is free
    pub fn try_lock(&self, session_id: &str) -> Option<SessionGuard> {
        self.mutex_for(session_id).try_lock_arc()
    }

    fn mutex_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        // Clone out of the entry so the shard lock is released before blocking.
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the session's entry if nobody holds or waits on it.
    ///
    /// Returns true if the entry was removed.
    pub fn release(&self, session_id: &str) -> bool {
        self.locks
            .remove_if(session_id, |_, mutex| Arc::strong_count(mutex) == 1)
            .is_some()
    }

    /// Drop every idle entry. Returns the number reclaimed.
    pub fn reclaim_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before.saturating_sub(self.locks.len())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
