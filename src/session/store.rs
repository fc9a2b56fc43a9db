//! Session State Store
//!
//! CRUD over session records, serialized per session through the
//! [`LockRegistry`]. Every operation takes the session's mutex for its
//! duration, reads hand back deep copies, and writes persist the whole
//! record through the [`BackingStore`].
//!
//! Missing sessions are initialized with defaults on first access; use
//! [`SessionStore::require_session`] where an existing session is mandatory.

use super::locks::LockRegistry;
use super::model::{SessionRecord, Section};
use super::ops::SessionState;
use super::scope::RequestScope;
use crate::admission::{EvictionListener, EvictionReason};
use crate::error::{StateError, StateResult, StoreResult};
use crate::store::BackingStore;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Aggregate counters for the observability endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub records_read: u64,
    pub records_written: u64,
    pub records_deleted: u64,
    pub scopes_opened: u64,
    pub scopes_flushed: u64,
    pub nested_scopes: u64,
    pub flush_failures: u64,
    pub flushes_discarded: u64,
    pub concurrent_modifications: u64,
    pub payments_completed: u64,
    pub payments_rejected: u64,
    pub live_locks: usize,
}

#[derive(Default)]
pub(crate) struct StoreCounters {
    pub(crate) records_read: AtomicU64,
    pub(crate) records_written: AtomicU64,
    pub(crate) records_deleted: AtomicU64,
    pub(crate) scopes_opened: AtomicU64,
    pub(crate) scopes_flushed: AtomicU64,
    pub(crate) nested_scopes: AtomicU64,
    pub(crate) flush_failures: AtomicU64,
    pub(crate) flushes_discarded: AtomicU64,
    pub(crate) concurrent_modifications: AtomicU64,
    pub(crate) payments_completed: AtomicU64,
    pub(crate) payments_rejected: AtomicU64,
}

/// Open request scopes for one session
#[derive(Debug, Default)]
struct ScopeSlot {
    depth: usize,
    /// Bumped by `destroy` while scopes are open so their flushes can tell
    /// the session is gone
    generation: u64,
}

pub struct SessionStore {
    backend: Arc<dyn BackingStore>,
    locks: LockRegistry,
    default_balance: f64,
    active_scopes: DashMap<String, ScopeSlot>,
    pub(crate) counters: StoreCounters,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn BackingStore>, default_balance: f64) -> Self {
        Self {
            backend,
            locks: LockRegistry::new(),
            default_balance,
            active_scopes: DashMap::new(),
            counters: StoreCounters::default(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn BackingStore> {
        &self.backend
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn default_balance(&self) -> f64 {
        self.default_balance
    }

    /// Load a record, or a default one if the session was never written.
    /// Caller must hold the session lock.
    pub(crate) fn load_or_default(&self, session_id: &str) -> StoreResult<SessionRecord> {
        self.counters.records_read.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .backend
            .get(session_id)?
            .unwrap_or_else(|| SessionRecord::new(self.default_balance)))
    }

    /// Persist a record. Caller must hold the session lock.
    pub(crate) fn persist(&self, session_id: &str, record: &SessionRecord) -> StoreResult<()> {
        self.backend.set(session_id, record)?;
        self.counters.records_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Run `f` against the session's record under its lock and persist the
    /// result if `f` changed it.
    pub fn with_record<T, F>(&self, session_id: &str, f: F) -> StateResult<T>
    where
        F: FnOnce(&mut SessionRecord) -> StateResult<T>,
    {
        let _guard = self.locks.lock(session_id);
        let original = self.load_or_default(session_id)?;
        let mut working = original.clone();
        let out = f(&mut working)?;
        if working != original {
            self.persist(session_id, &working)?;
        }
        Ok(out)
    }

    /// Handle for running session operations directly against the store
    pub fn session(&self, session_id: &str) -> SessionHandle<'_> {
        SessionHandle {
            store: self,
            session_id: session_id.to_string(),
        }
    }

    pub fn get_session_data(&self, session_id: &str) -> StateResult<SessionRecord> {
        self.session(session_id).snapshot()
    }

    pub fn get_section(&self, session_id: &str, name: &str) -> StateResult<serde_json::Value> {
        self.session(session_id).get_section(name)
    }

    pub fn update_section(
        &self,
        session_id: &str,
        name: &str,
        partial: &serde_json::Value,
    ) -> StateResult<()> {
        self.session(session_id).update_section(name, partial)
    }

    pub fn reset(&self, session_id: &str) -> StateResult<()> {
        self.session(session_id).reset()
    }

    /// Read a session that must already exist
    pub fn require_session(&self, session_id: &str) -> StateResult<SessionRecord> {
        let _guard = self.locks.lock(session_id);
        self.counters.records_read.fetch_add(1, Ordering::Relaxed);
        self.backend
            .get(session_id)?
            .ok_or_else(|| StateError::SessionNotFound(session_id.to_string()))
    }

    /// Read one section of a session that must already exist
    pub fn require_section(&self, session_id: &str, name: &str) -> StateResult<serde_json::Value> {
        let section: Section = name.parse()?;
        self.require_session(session_id)?.section_value(section)
    }

    pub fn exists(&self, session_id: &str) -> StateResult<bool> {
        let _guard = self.locks.lock(session_id);
        Ok(self.backend.get(session_id)?.is_some())
    }

    /// Delete the session's record and reclaim its lock entry. Scopes still
    /// open for the session will refuse to flush.
    ///
    /// Returns true if a record existed.
    pub fn destroy(&self, session_id: &str) -> StateResult<bool> {
        let existed = {
            let _guard = self.locks.lock(session_id);
            let existed = self.backend.delete(session_id)?;
            if let Some(mut slot) = self.active_scopes.get_mut(session_id) {
                slot.generation += 1;
            }
            existed
        };
        self.locks.release(session_id);
        if existed {
            self.counters.records_deleted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(existed)
    }

    /// Open a request scope that batches all reads/writes for one request
    pub fn begin_request(self: &Arc<Self>, session_id: &str) -> RequestScope {
        RequestScope::open(Arc::clone(self), session_id.to_string())
    }

    /// Run `f` inside a request scope and flush on the way out.
    ///
    /// The scope flushes even when `f` fails; `f`'s error wins over a flush
    /// error.
    pub fn with_request_scope<T, F>(self: &Arc<Self>, session_id: &str, f: F) -> StateResult<T>
    where
        F: FnOnce(&mut RequestScope) -> StateResult<T>,
    {
        let mut scope = self.begin_request(session_id);
        let result = f(&mut scope);
        let flushed = scope.finish();
        let value = result?;
        flushed?;
        Ok(value)
    }

    /// Register a newly opened scope. Returns the depth before it and the
    /// session's current generation.
    pub(crate) fn enter_scope(&self, session_id: &str) -> (usize, u64) {
        self.counters.scopes_opened.fetch_add(1, Ordering::Relaxed);
        let mut slot = self.active_scopes.entry(session_id.to_string()).or_default();
        let outer = slot.depth;
        slot.depth += 1;
        if outer > 0 {
            self.counters.nested_scopes.fetch_add(1, Ordering::Relaxed);
        }
        (outer, slot.generation)
    }

    pub(crate) fn exit_scope(&self, session_id: &str) {
        if let Some(mut slot) = self.active_scopes.get_mut(session_id) {
            slot.depth = slot.depth.saturating_sub(1);
        }
        self.active_scopes.remove_if(session_id, |_, slot| slot.depth == 0);
    }

    /// Generation of a session with open scopes. Caller must hold the
    /// session lock for the answer to stay valid.
    pub(crate) fn scope_generation(&self, session_id: &str) -> Option<u64> {
        self.active_scopes.get(session_id).map(|slot| slot.generation)
    }

    /// Number of request scopes currently open for a session
    pub fn open_scopes(&self, session_id: &str) -> usize {
        self.active_scopes.get(session_id).map_or(0, |slot| slot.depth)
    }

    pub fn stats(&self) -> StoreStats {
        let c = &self.counters;
        StoreStats {
            records_read: c.records_read.load(Ordering::Relaxed),
            records_written: c.records_written.load(Ordering::Relaxed),
            records_deleted: c.records_deleted.load(Ordering::Relaxed),
            scopes_opened: c.scopes_opened.load(Ordering::Relaxed),
            scopes_flushed: c.scopes_flushed.load(Ordering::Relaxed),
            nested_scopes: c.nested_scopes.load(Ordering::Relaxed),
            flush_failures: c.flush_failures.load(Ordering::Relaxed),
            flushes_discarded: c.flushes_discarded.load(Ordering::Relaxed),
            concurrent_modifications: c.concurrent_modifications.load(Ordering::Relaxed),
            payments_completed: c.payments_completed.load(Ordering::Relaxed),
            payments_rejected: c.payments_rejected.load(Ordering::Relaxed),
            live_locks: self.locks.len(),
        }
    }
}

impl EvictionListener for SessionStore {
    fn on_evict(&self, session_id: &str, reason: EvictionReason) {
        match self.destroy(session_id) {
            Ok(existed) => {
                tracing::debug!(session_id = %session_id, %reason, existed, "session_state_destroyed");
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, %reason, error = %e, "session_state_destroy_failed");
            }
        }
    }
}

/// Direct, per-operation access to one session
pub struct SessionHandle<'a> {
    store: &'a SessionStore,
    session_id: String,
}

impl SessionState for SessionHandle<'_> {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn default_balance(&self) -> f64 {
        self.store.default_balance
    }

    fn snapshot(&mut self) -> StateResult<SessionRecord> {
        let _guard = self.store.locks.lock(&self.session_id);
        Ok(self.store.load_or_default(&self.session_id)?)
    }

    fn modify<T, F>(&mut self, f: F) -> StateResult<T>
    where
        F: FnOnce(&mut SessionRecord) -> StateResult<T>,
    {
        self.store.with_record(&self.session_id, f)
    }
}
