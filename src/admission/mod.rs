//! Session Admission Controller
//!
//! Decides whether a new session may be created given the live-session cap
//! and current memory headroom, tracks last access for every admitted
//! session, and expires idle ones.
//!
//! Memory is read before the session map is locked; the map lock is held
//! only for the bookkeeping itself. Eviction listeners are notified after
//! the lock is released.

use crate::clock::SharedClock;
use crate::config::SessionsConfig;
use crate::resource::ResourceMonitor;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// SHA-256 hex digest of credential material
pub fn hash_credential(material: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Bookkeeping for one admitted session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionAdmissionRecord {
    pub session_id: String,
    pub created_at: Instant,
    pub last_access: Instant,
    /// Wall-clock admission time, for reporting
    pub admitted_at: DateTime<Utc>,
    pub credential_hash: Option<String>,
    pub memory_allocated_estimate: u64,
}

/// Why a session was not admitted
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdmissionRejected {
    #[error("Insufficient memory: session needs {required} bytes, {available} available")]
    InsufficientMemory { required: u64, available: u64 },

    #[error("Session limit reached: {live} of {max} sessions in use")]
    SessionLimit { live: usize, max: usize },

    #[error("Memory pressure: utilization {utilization:.2} at or above threshold {threshold:.2}")]
    MemoryPressure { utilization: f64, threshold: f64 },
}

/// Why a session left the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Idle past the expiry
    Expired,
    /// Removed explicitly
    Removed,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionReason::Expired => write!(f, "expired"),
            EvictionReason::Removed => write!(f, "removed"),
        }
    }
}

/// Notified when a session stops being tracked
pub trait EvictionListener: Send + Sync {
    fn on_evict(&self, session_id: &str, reason: EvictionReason);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionStats {
    pub live_sessions: usize,
    pub max_sessions: usize,
    pub sessions_created: u64,
    pub sessions_rejected: u64,
    pub sessions_expired: u64,
    pub sessions_removed: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    rejected: AtomicU64,
    expired: AtomicU64,
    removed: AtomicU64,
}

pub struct AdmissionController {
    config: SessionsConfig,
    monitor: Arc<ResourceMonitor>,
    clock: SharedClock,
    sessions: Mutex<HashMap<String, SessionAdmissionRecord>>,
    listeners: RwLock<Vec<Arc<dyn EvictionListener>>>,
    counters: Counters,
}

impl AdmissionController {
    pub fn new(config: SessionsConfig, monitor: Arc<ResourceMonitor>, clock: SharedClock) -> Self {
        Self {
            config,
            monitor,
            clock,
            sessions: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn EvictionListener>) {
        self.listeners.write().push(listener);
    }

    /// Admit a session, or refresh its last access if already admitted
    pub fn create_session(
        &self,
        session_id: &str,
        credential_hash: Option<String>,
    ) -> Result<(), AdmissionRejected> {
        if self.touch(session_id) {
            return Ok(());
        }

        let required = self.config.memory_per_session_bytes();
        let reading = self.monitor.check_pressure();

        let now = self.clock.now();
        let mut sessions = self.sessions.lock();
        if let Some(record) = sessions.get_mut(session_id) {
            record.last_access = now;
            return Ok(());
        }

        let available = reading.usage.available_bytes();
        let rejection = if let Some(available) = available.filter(|a| required > *a) {
            Some(AdmissionRejected::InsufficientMemory {
                required,
                available,
            })
        } else if sessions.len() >= self.config.max_sessions {
            Some(AdmissionRejected::SessionLimit {
                live: sessions.len(),
                max: self.config.max_sessions,
            })
        } else if reading.under_pressure {
            Some(AdmissionRejected::MemoryPressure {
                utilization: reading.utilization.unwrap_or_default(),
                threshold: self.monitor.threshold(),
            })
        } else {
            None
        };

        if let Some(rejection) = rejection {
            drop(sessions);
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(session_id = %session_id, reason = %rejection, "session_rejected");
            return Err(rejection);
        }

        sessions.insert(
            session_id.to_string(),
            SessionAdmissionRecord {
                session_id: session_id.to_string(),
                created_at: now,
                last_access: now,
                admitted_at: Utc::now(),
                credential_hash,
                memory_allocated_estimate: required,
            },
        );
        let live = sessions.len();
        drop(sessions);

        self.counters.created.fetch_add(1, Ordering::Relaxed);
        tracing::info!(session_id = %session_id, live, "session_created");
        Ok(())
    }

    /// Refresh last access. Returns false if the session is not tracked.
    pub fn touch(&self, session_id: &str) -> bool {
        let now = self.clock.now();
        match self.sessions.lock().get_mut(session_id) {
            Some(record) => {
                record.last_access = now;
                true
            }
            None => false,
        }
    }

    pub fn remove_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.lock().remove(session_id).is_some();
        if removed {
            self.counters.removed.fetch_add(1, Ordering::Relaxed);
            tracing::info!(session_id = %session_id, "session_removed");
            self.notify(&[session_id.to_string()], EvictionReason::Removed);
        }
        removed
    }

    /// Remove every session idle for longer than the expiry. Returns how many
    /// were removed.
    pub fn cleanup_expired_sessions(&self) -> usize {
        let now = self.clock.now();
        let expiry = self.config.expiry();

        let expired: Vec<String> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<String> = sessions
                .values()
                .filter(|r| now.saturating_duration_since(r.last_access) > expiry)
                .map(|r| r.session_id.clone())
                .collect();
            for id in &ids {
                sessions.remove(id);
            }
            ids
        };

        if !expired.is_empty() {
            self.counters
                .expired
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            tracing::info!(count = expired.len(), "sessions_expired");
            self.notify(&expired, EvictionReason::Expired);
        }
        expired.len()
    }

    fn notify(&self, session_ids: &[String], reason: EvictionReason) {
        let listeners = self.listeners.read().clone();
        for id in session_ids {
            for listener in &listeners {
                listener.on_evict(id, reason);
            }
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionAdmissionRecord> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            live_sessions: self.live_sessions(),
            max_sessions: self.config.max_sessions,
            sessions_created: self.counters.created.load(Ordering::Relaxed),
            sessions_rejected: self.counters.rejected.load(Ordering::Relaxed),
            sessions_expired: self.counters.expired.load(Ordering::Relaxed),
            sessions_removed: self.counters.removed.load(Ordering::Relaxed),
        }
    }
}
