//! Batch Write Cache
//!
//! A [`RequestScope`] is bound to one (session, request) pair. The first
//! read pulls the record from the backing store; every later read and write
//! runs against that cached copy, and the scope writes it back once, only
//! if something changed.
//!
//! ## Lifecycle
//!
//! ```text
//! begin_request(id) ── get/update ... get/update ── finish()  (or drop)
//!        │                                              │
//!        └── 1 backing-store read (lazy)                └── ≤ 1 backing-store write
//! ```
//!
//! ## Flush
//!
//! A flush re-reads the stored record under the session lock and writes back
//! only the sections this scope changed. Conversation and credential changes
//! merge onto whatever is stored. Order and payment changes carry the
//! version token the scope loaded; if another writer committed since, the
//! flush is refused with [`StateError::ConcurrentModification`]. A session
//! destroyed while the scope was open is never written back.
//!
//! Scopes are explicit values passed down the call chain. Opening a second
//! scope for a session that already has one is allowed but logged: the inner
//! scope has its own cache, and the outer scope is untouched when it closes.
//! Dropping a scope without calling [`RequestScope::finish`] still flushes;
//! a flush failure on drop is logged because it cannot be returned.

use super::atomic::{PaymentOutcome, UpdateOutcome};
use super::model::{OrderState, PaymentState, Section, SessionRecord};
use super::ops::SessionState;
use super::store::SessionStore;
use crate::error::{StateError, StateResult, StoreResult};
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// What a finished scope did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeSummary {
    /// Logical writes applied to the cached record
    pub updates: usize,
    /// Backing-store writes performed by this scope
    pub writes: usize,
}

pub struct RequestScope {
    store: Arc<SessionStore>,
    session_id: String,
    request_id: String,
    /// Session generation when the scope opened
    generation: u64,
    cached: Option<SessionRecord>,
    /// Version token of the stored record the cache is based on
    base_version: u64,
    dirty: BTreeSet<Section>,
    updates: usize,
    writes: usize,
    closed: bool,
}

impl std::fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScope")
            .field("session_id", &self.session_id)
            .field("request_id", &self.request_id)
            .field("generation", &self.generation)
            .field("base_version", &self.base_version)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl RequestScope {
    pub(crate) fn open(store: Arc<SessionStore>, session_id: String) -> Self {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (outer, generation) = store.enter_scope(&session_id);
        if outer > 0 {
            tracing::warn!(
                session_id = %session_id,
                request_id = %request_id,
                depth = outer + 1,
                "nested_request_scope"
            );
        }
        Self {
            store,
            session_id,
            request_id,
            generation,
            cached: None,
            base_version: 0,
            dirty: BTreeSet::new(),
            updates: 0,
            writes: 0,
            closed: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Cached record, loading it on first use
    fn cached_mut(&mut self) -> StoreResult<&mut SessionRecord> {
        let record = match self.cached.take() {
            Some(record) => record,
            None => {
                let _guard = self.store.locks().lock(&self.session_id);
                let record = self.store.load_or_default(&self.session_id)?;
                self.base_version = record.payment.version;
                record
            }
        };
        Ok(self.cached.insert(record))
    }

    /// Replace the whole cached record
    pub fn update_session_data(&mut self, record: SessionRecord) -> StateResult<()> {
        let cached = self.cached_mut()?;
        let changed = record.changed_sections(cached);
        *cached = record;
        self.dirty.extend(changed);
        self.updates += 1;
        Ok(())
    }

    fn is_destroyed(&self) -> bool {
        self.store.scope_generation(&self.session_id) != Some(self.generation)
    }

    /// Write the changed sections back. Returns true if a write happened.
    pub fn flush(&mut self) -> StateResult<bool> {
        if self.dirty.is_empty() {
            return Ok(false);
        }
        let Some(cached) = self.cached.as_ref() else {
            return Ok(false);
        };

        let merged = {
            let _guard = self.store.locks().lock(&self.session_id);
            if self.is_destroyed() {
                self.store
                    .counters
                    .flushes_discarded
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    session_id = %self.session_id,
                    request_id = %self.request_id,
                    "request_scope_flush_discarded"
                );
                self.dirty.clear();
                return Err(StateError::SessionNotFound(self.session_id.clone()));
            }

            let mut merged = self.store.load_or_default(&self.session_id)?;
            let found = merged.payment.version;
            let versioned = self.dirty.iter().any(|section| section.is_versioned());
            if versioned && found != self.base_version {
                self.store
                    .counters
                    .concurrent_modifications
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    session_id = %self.session_id,
                    request_id = %self.request_id,
                    expected = self.base_version,
                    found,
                    "request_scope_conflict"
                );
                return Err(StateError::ConcurrentModification {
                    expected: self.base_version,
                    found,
                });
            }

            for section in &self.dirty {
                merged.copy_section(*section, cached);
            }
            if versioned {
                merged.payment.version = cached.payment.version.max(found + 1);
            }
            if let Err(e) = self.store.persist(&self.session_id, &merged) {
                self.store
                    .counters
                    .flush_failures
                    .fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
            merged
        };

        self.base_version = merged.payment.version;
        self.cached = Some(merged);
        self.dirty.clear();
        self.writes += 1;
        self.store
            .counters
            .scopes_flushed
            .fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Optimistic order update that sees this scope's pending changes.
    ///
    /// Pending changes are flushed first, the transaction commits against
    /// the store, and the cache reloads on the next read.
    pub fn atomic_order_update<T, F>(&mut self, mutate: F) -> StateResult<UpdateOutcome<T>>
    where
        F: FnOnce(&mut OrderState, &mut PaymentState) -> T,
    {
        if self.is_destroyed() {
            return Err(StateError::SessionNotFound(self.session_id.clone()));
        }
        self.flush()?;
        let outcome = self.store.atomic_order_update(&self.session_id, mutate);
        self.cached = None;
        outcome
    }

    /// Settle the tab, including items added earlier in this scope
    pub fn atomic_payment_complete(&mut self) -> PaymentOutcome {
        if self.is_destroyed() {
            return PaymentOutcome::Failed {
                reason: StateError::SessionNotFound(self.session_id.clone()).to_string(),
            };
        }
        if let Err(e) = self.flush() {
            tracing::warn!(
                session_id = %self.session_id,
                request_id = %self.request_id,
                error = %e,
                "payment_failed"
            );
            return PaymentOutcome::Failed {
                reason: e.to_string(),
            };
        }
        let outcome = self.store.atomic_payment_complete(&self.session_id);
        self.cached = None;
        outcome
    }

    /// Flush and close the scope
    pub fn finish(mut self) -> StateResult<ScopeSummary> {
        self.closed = true;
        self.flush()?;
        Ok(ScopeSummary {
            updates: self.updates,
            writes: self.writes,
        })
    }
}

impl SessionState for RequestScope {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn default_balance(&self) -> f64 {
        self.store.default_balance()
    }

    fn snapshot(&mut self) -> StateResult<SessionRecord> {
        Ok(self.cached_mut()?.clone())
    }

    fn modify<T, F>(&mut self, f: F) -> StateResult<T>
    where
        F: FnOnce(&mut SessionRecord) -> StateResult<T>,
    {
        let cached = self.cached_mut()?;
        let mut working = cached.clone();
        let out = f(&mut working)?;
        let changed = working.changed_sections(cached);
        if !changed.is_empty() {
            *cached = working;
            self.dirty.extend(changed);
            self.updates += 1;
        }
        Ok(out)
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.flush() {
                tracing::error!(
                    session_id = %self.session_id,
                    request_id = %self.request_id,
                    error = %e,
                    "request_scope_flush_failed"
                );
            }
        }
        self.store.exit_scope(&self.session_id);
    }
}
