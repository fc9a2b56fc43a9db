//! Session Core
//!
//! Wires the rate limiter, resource monitor, admission controller and
//! session store into one service constructed at process start and shared
//! by every request worker.
//!
//! ## Request path
//!
//! ```text
//! begin_request(id, credential)
//!   ├─ RateLimiter::check_limits         → RateLimited
//!   ├─ AdmissionController::create_session → AdmissionRejected
//!   │     (rejected ids are forgotten by the rate limiter)
//!   └─ SessionStore::begin_request       → RequestScope
//! ```
//!
//! Admission evictions fan out to the session store (record and lock entry
//! deleted) and the rate limiter (bucket and burst history dropped).

use crate::admission::{AdmissionController, AdmissionRejected, AdmissionStats};
use crate::background::PeriodicTask;
use crate::clock::{self, SharedClock};
use crate::config::{Config, ConfigError};
use crate::error::{StateResult, StoreError};
use crate::ratelimit::{BucketSnapshot, RateLimited, RateLimiter, RateLimiterStats};
use crate::resource::{MemorySource, MemoryUsage, ResourceMonitor};
use crate::session::{RequestScope, SessionStore, StoreStats};
use crate::store::{self, BackingStore};
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Thread name of the idle-session sweep
pub const SESSION_SWEEP_THREAD: &str = "tabkeeper-session-sweep";
/// Thread name of the rate-limiter sweep
pub const RATE_LIMIT_SWEEP_THREAD: &str = "tabkeeper-ratelimit-sweep";

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to open backing store: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to start background task: {0}")]
    Background(#[from] io::Error),
}

/// Request refused before any session state was touched
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestRejected {
    #[error("{0}")]
    RateLimited(#[from] RateLimited),

    #[error("{0}")]
    Admission(#[from] AdmissionRejected),
}

/// Memory figures as last read
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryStats {
    pub usage: MemoryUsage,
    pub utilization: Option<f64>,
    pub pressure_threshold: f64,
}

/// Aggregate counters for external reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoreStats {
    pub admission: AdmissionStats,
    pub rate_limiter: RateLimiterStats,
    pub session_buckets: Vec<(String, BucketSnapshot)>,
    pub store: StoreStats,
    pub memory: MemoryStats,
}

pub struct SessionCore {
    config: Config,
    store: Arc<SessionStore>,
    limiter: Arc<RateLimiter>,
    monitor: Arc<ResourceMonitor>,
    admission: Arc<AdmissionController>,
    background: Mutex<Vec<PeriodicTask>>,
}

impl SessionCore {
    /// Build the core from configuration: validated config, configured
    /// backing store, cgroup memory readings and the system clock.
    pub fn from_config(config: Config) -> Result<Self, CoreError> {
        config.validate()?;
        let backend = store::open(&config.store)?;
        let clock = clock::system();
        let monitor = ResourceMonitor::from_config(&config.memory, Arc::clone(&clock));
        Ok(Self::assemble(config, backend, monitor, clock))
    }

    /// Build the core around explicit components
    pub fn with_components(
        config: Config,
        backend: Arc<dyn BackingStore>,
        memory_source: Box<dyn MemorySource>,
        clock: SharedClock,
    ) -> Self {
        let monitor = ResourceMonitor::new(
            memory_source,
            config.memory.pressure_threshold,
            Duration::from_secs(config.memory.pressure_cooldown_secs),
            Arc::clone(&clock),
        );
        Self::assemble(config, backend, monitor, clock)
    }

    fn assemble(
        config: Config,
        backend: Arc<dyn BackingStore>,
        monitor: ResourceMonitor,
        clock: SharedClock,
    ) -> Self {
        let store = Arc::new(SessionStore::new(backend, config.sessions.default_balance));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), Arc::clone(&clock)));
        let monitor = Arc::new(monitor);
        let admission = Arc::new(AdmissionController::new(
            config.sessions.clone(),
            Arc::clone(&monitor),
            clock,
        ));
        admission.add_listener(store.clone());
        admission.add_listener(limiter.clone());

        Self {
            config,
            store,
            limiter,
            monitor,
            admission,
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Gate one inbound turn and open its request scope.
    ///
    /// `credential` is the caller's raw key material, if any; only its hash
    /// is kept by the admission controller.
    pub fn begin_request(
        &self,
        session_id: &str,
        credential: Option<&str>,
    ) -> Result<RequestScope, RequestRejected> {
        self.limiter.check_limits(session_id)?;
        let credential_hash = credential.map(crate::admission::hash_credential);
        if let Err(rejected) = self.admission.create_session(session_id, credential_hash) {
            // Only untracked ids are rejected; drop the limiter entries the
            // check just created. The application token stays spent.
            self.limiter.forget(session_id);
            return Err(rejected.into());
        }
        Ok(self.store.begin_request(session_id))
    }

    /// Stop tracking a session and delete its state. Returns true if the
    /// session was admitted or had stored state.
    pub fn end_session(&self, session_id: &str) -> StateResult<bool> {
        if self.admission.remove_session(session_id) {
            return Ok(true);
        }
        self.limiter.forget(session_id);
        self.store.destroy(session_id)
    }

    /// Start the idle-session and rate-limiter sweeps. Calling again while
    /// they run is a no-op.
    pub fn start_background(&self) -> Result<(), CoreError> {
        let mut tasks = self.background.lock();
        if !tasks.is_empty() {
            return Ok(());
        }
        let interval = self.config.cleanup.interval();

        let admission = Arc::clone(&self.admission);
        let store = Arc::clone(&self.store);
        tasks.push(PeriodicTask::spawn(SESSION_SWEEP_THREAD, interval, move || {
            let expired = admission.cleanup_expired_sessions();
            let reclaimed = store.locks().reclaim_idle();
            tracing::debug!(expired, reclaimed, "session_sweep");
        })?);

        let limiter = Arc::clone(&self.limiter);
        tasks.push(PeriodicTask::spawn(RATE_LIMIT_SWEEP_THREAD, interval, move || {
            limiter.cleanup_stale();
        })?);

        tracing::info!(interval_secs = interval.as_secs(), "background_sweeps_started");
        Ok(())
    }

    pub fn background_running(&self) -> bool {
        self.background.lock().iter().any(PeriodicTask::is_running)
    }

    /// Stop the sweeps, waiting at most the configured timeout for each.
    /// Returns false if any sweep had to be left detached.
    pub fn shutdown(&self) -> bool {
        let timeout = self.config.cleanup.shutdown_timeout();
        let tasks: Vec<PeriodicTask> = self.background.lock().drain(..).collect();
        if tasks.is_empty() {
            return true;
        }
        let mut clean = true;
        for mut task in tasks {
            clean &= task.stop(timeout);
        }
        tracing::info!(clean, "background_sweeps_stopped");
        clean
    }

    /// Snapshot of every counter. Each component is copied under its own
    /// lock in turn; no two are held together.
    pub fn stats(&self) -> CoreStats {
        let usage = self.monitor.usage();
        CoreStats {
            admission: self.admission.stats(),
            rate_limiter: self.limiter.stats(),
            session_buckets: self.limiter.bucket_snapshots(),
            store: self.store.stats(),
            memory: MemoryStats {
                usage,
                utilization: usage.utilization(),
                pressure_threshold: self.monitor.threshold(),
            },
        }
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::resource::FixedMemorySource;
    use crate::session::{LineItem, SessionState};
    use crate::store::MemoryStore;

    fn core_with(config: Config) -> (SessionCore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let core = SessionCore::with_components(
            config,
            Arc::new(MemoryStore::new()),
            Box::new(FixedMemorySource::default()),
            clock.clone(),
        );
        (core, clock)
    }

    #[test]
    fn test_begin_request_opens_scope() {
        let (core, _clock) = core_with(Config::default());
        let mut scope = core.begin_request("s1", Some("sk-live")).unwrap();
        scope.add_item(LineItem::new("Beer", 6.0)).unwrap();
        scope.finish().unwrap();

        assert!(core.admission().contains("s1"));
        assert!(core.admission().get("s1").unwrap().credential_hash.is_some());
        assert_eq!(
            core.store().get_session_data("s1").unwrap().payment.tab_total,
            6.0
        );
    }

    #[test]
    fn test_rate_limit_rejection_reason() {
        let mut config = Config::default();
        config.rate_limit.session_limit = 1;
        let (core, _clock) = core_with(config);
        drop(core.begin_request("s1", None).unwrap());
        let err = core.begin_request("s1", None).unwrap_err();
        assert!(matches!(err, RequestRejected::RateLimited(_)));
        assert!(err.to_string().contains("Session rate limit"));
    }

    #[test]
    fn test_admission_rejection() {
        let mut config = Config::default();
        config.sessions.max_sessions = 1;
        let (core, _clock) = core_with(config);
        drop(core.begin_request("s1", None).unwrap());
        let err = core.begin_request("s2", None).unwrap_err();
        assert!(matches!(
            err,
            RequestRejected::Admission(AdmissionRejected::SessionLimit { .. })
        ));
        assert!(!core.store().exists("s2").unwrap());
    }

    #[test]
    fn test_admission_rejection_leaves_no_limiter_state() {
        let mut config = Config::default();
        config.sessions.max_sessions = 1;
        let (core, _clock) = core_with(config);
        drop(core.begin_request("s1", None).unwrap());
        for _ in 0..3 {
            assert!(core.begin_request("s2", None).is_err());
        }

        assert!(core.limiter().session_bucket("s2").is_none());
        let stats = core.limiter().stats();
        assert_eq!(stats.tracked_sessions, 1);
        assert_eq!(stats.tracked_histories, 1);
        // Application tokens spent by the refused requests are not refunded
        assert_eq!(stats.app_bucket.tokens, 996.0);
    }

    #[test]
    fn test_expiry_during_open_scope_does_not_resurrect_session() {
        let mut config = Config::default();
        config.sessions.expiry_secs = 60;
        let (core, clock) = core_with(config);
        let mut scope = core.begin_request("s1", None).unwrap();
        scope.advance_turn(false).unwrap();

        clock.advance(Duration::from_secs(61));
        assert_eq!(core.admission().cleanup_expired_sessions(), 1);
        assert!(matches!(
            scope.finish(),
            Err(crate::error::StateError::SessionNotFound(_))
        ));
        assert!(!core.admission().contains("s1"));
        assert!(!core.store().exists("s1").unwrap());
        assert_eq!(core.store().stats().flushes_discarded, 1);
    }

    #[test]
    fn test_end_session_during_open_scope_discards_flush() {
        let (core, _clock) = core_with(Config::default());
        let mut scope = core.begin_request("s1", None).unwrap();
        scope.add_item(LineItem::new("Beer", 6.0)).unwrap();
        assert!(core.end_session("s1").unwrap());
        drop(scope);
        assert!(!core.store().exists("s1").unwrap());
    }

    #[test]
    fn test_from_config_uses_configured_threshold() {
        let mut config = Config::default();
        config.memory.pressure_threshold = 0.65;
        let core = SessionCore::from_config(config).unwrap();
        assert_eq!(core.monitor().threshold(), 0.65);
        assert_eq!(core.stats().memory.pressure_threshold, 0.65);
    }

    #[test]
    fn test_expiry_removes_state_everywhere() {
        let mut config = Config::default();
        config.sessions.expiry_secs = 60;
        let (core, clock) = core_with(config);
        let mut scope = core.begin_request("s1", None).unwrap();
        scope.advance_turn(false).unwrap();
        scope.finish().unwrap();

        clock.advance(Duration::from_secs(61));
        assert_eq!(core.admission().cleanup_expired_sessions(), 1);
        assert!(!core.store().exists("s1").unwrap());
        assert!(core.limiter().session_bucket("s1").is_none());
    }

    #[test]
    fn test_end_session() {
        let (core, _clock) = core_with(Config::default());
        drop(core.begin_request("s1", None).unwrap());
        core.store().session("s1").advance_turn(false).unwrap();
        assert!(core.end_session("s1").unwrap());
        assert!(!core.store().exists("s1").unwrap());
        assert!(!core.end_session("s1").unwrap());
    }

    #[test]
    fn test_background_lifecycle() {
        let mut config = Config::default();
        config.cleanup.interval_secs = 3600;
        let (core, _clock) = core_with(config);
        core.start_background().unwrap();
        core.start_background().unwrap();
        assert!(core.background_running());
        assert!(core.shutdown());
        assert!(!core.background_running());
    }

    #[test]
    fn test_stats_serialize() {
        let (core, _clock) = core_with(Config::default());
        drop(core.begin_request("s1", None).unwrap());
        let stats = core.stats();
        assert_eq!(stats.admission.live_sessions, 1);
        assert_eq!(stats.rate_limiter.allowed, 1);
        assert_eq!(stats.session_buckets.len(), 1);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["admission"]["sessions_created"], 1);
        assert!(json["memory"]["utilization"].is_null());
    }
}
