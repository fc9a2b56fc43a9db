//! Rate Limiter
//!
//! Three checks gate every request:
//! - **Burst**: a sliding window of recent request times per session
//! - **Application**: one bucket shared by every session
//! - **Session**: one bucket per session, created on first use
//!
//! ## Locking
//!
//! All three checks and their debits happen in one critical section. Locks
//! are always taken in the order burst history → session buckets → app
//! bucket, so concurrent sessions cannot deadlock.
//!
//! ## Burst accounting
//!
//! A request refused by the burst check is still recorded in the window.
//! Clients that keep retrying while throttled stay throttled instead of
//! waiting out a clean window.

mod bucket;

pub use bucket::{BucketSnapshot, BucketState, TokenBucket};

use crate::admission::{EvictionListener, EvictionReason};
use crate::clock::SharedClock;
use crate::config::RateLimitConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Which limit refused a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Burst,
    Application,
    Session,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Burst => write!(f, "burst"),
            LimitKind::Application => write!(f, "application"),
            LimitKind::Session => write!(f, "session"),
        }
    }
}

/// Request refused by the rate limiter
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason}")]
pub struct RateLimited {
    pub kind: LimitKind,
    pub reason: String,
}

/// Rate limiter counters and live entry counts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub allowed: u64,
    pub rejected_burst: u64,
    pub rejected_application: u64,
    pub rejected_session: u64,
    pub tracked_sessions: usize,
    pub tracked_histories: usize,
    pub app_bucket: BucketSnapshot,
}

#[derive(Default)]
struct Counters {
    allowed: AtomicU64,
    rejected_burst: AtomicU64,
    rejected_application: AtomicU64,
    rejected_session: AtomicU64,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    clock: SharedClock,
    burst_history: Mutex<HashMap<String, VecDeque<Instant>>>,
    session_buckets: Mutex<HashMap<String, BucketState>>,
    app_bucket: TokenBucket,
    counters: Counters,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> Self {
        let app_bucket = TokenBucket::per_minute(config.app_limit, Arc::clone(&clock));
        Self {
            config,
            clock,
            burst_history: Mutex::new(HashMap::new()),
            session_buckets: Mutex::new(HashMap::new()),
            app_bucket,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit or refuse one request for `session_id`, debiting the
    /// application and session buckets when admitted.
    pub fn check_limits(&self, session_id: &str) -> Result<(), RateLimited> {
        let now = self.clock.now();
        let window = self.config.burst_window();

        let mut history = self.burst_history.lock();
        let mut sessions = self.session_buckets.lock();
        let mut app = self.app_bucket.lock();

        let times = history.entry(session_id.to_string()).or_default();
        while times
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            times.pop_front();
        }
        let burst_full = times.len() >= self.config.burst_limit as usize;
        times.push_back(now);
        if burst_full {
            return Err(self.refuse(
                session_id,
                LimitKind::Burst,
                format!(
                    "Burst limit exceeded: more than {} requests in {} seconds",
                    self.config.burst_limit, self.config.burst_window_secs
                ),
            ));
        }

        app.refill(now);
        if !app.has(1.0) {
            return Err(self.refuse(
                session_id,
                LimitKind::Application,
                format!(
                    "Application rate limit exceeded: {} requests per minute",
                    self.config.app_limit
                ),
            ));
        }

        let bucket = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| BucketState::per_minute(self.config.session_limit, now));
        bucket.refill(now);
        if !bucket.has(1.0) {
            return Err(self.refuse(
                session_id,
                LimitKind::Session,
                format!(
                    "Session rate limit exceeded: {} requests per minute",
                    self.config.session_limit
                ),
            ));
        }

        bucket.debit(1.0, now);
        app.debit(1.0, now);
        self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn refuse(&self, session_id: &str, kind: LimitKind, reason: String) -> RateLimited {
        let counter = match kind {
            LimitKind::Burst => &self.counters.rejected_burst,
            LimitKind::Application => &self.counters.rejected_application,
            LimitKind::Session => &self.counters.rejected_session,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session_id = %session_id, limit = %kind, "rate_limited");
        RateLimited { kind, reason }
    }

    /// Drop buckets and burst histories untouched for the configured age
    pub fn cleanup_stale(&self) -> usize {
        self.cleanup_older_than(self.config.stale_after())
    }

    /// Drop buckets and burst histories untouched for at least `age`.
    /// Returns the number of entries removed.
    pub fn cleanup_older_than(&self, age: Duration) -> usize {
        let now = self.clock.now();
        let is_stale = |t: Instant| now.saturating_duration_since(t) >= age;

        let mut history = self.burst_history.lock();
        let mut sessions = self.session_buckets.lock();

        let before = history.len() + sessions.len();
        history.retain(|_, times| times.back().is_some_and(|t| !is_stale(*t)));
        sessions.retain(|_, bucket| !is_stale(bucket.last_used()));
        let removed = before - history.len() - sessions.len();

        if removed > 0 {
            tracing::debug!(removed, "rate_limiter_cleanup");
        }
        removed
    }

    /// Current state of one session's bucket
    pub fn session_bucket(&self, session_id: &str) -> Option<BucketSnapshot> {
        let now = self.clock.now();
        self.session_buckets
            .lock()
            .get(session_id)
            .map(|b| b.snapshot(now))
    }

    /// Copy of every session bucket, sorted by session id
    pub fn bucket_snapshots(&self) -> Vec<(String, BucketSnapshot)> {
        let now = self.clock.now();
        let mut snapshots: Vec<_> = self
            .session_buckets
            .lock()
            .iter()
            .map(|(id, b)| (id.clone(), b.snapshot(now)))
            .collect();
        snapshots.sort_by(|a, b| a.0.cmp(&b.0));
        snapshots
    }

    /// Forget everything known about one session
    pub fn forget(&self, session_id: &str) {
        let mut history = self.burst_history.lock();
        let mut sessions = self.session_buckets.lock();
        history.remove(session_id);
        sessions.remove(session_id);
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = self.clock.now();
        let tracked_histories = self.burst_history.lock().len();
        let tracked_sessions = self.session_buckets.lock().len();
        let app_bucket = self.app_bucket.snapshot();
        RateLimiterStats {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            rejected_burst: self.counters.rejected_burst.load(Ordering::Relaxed),
            rejected_application: self.counters.rejected_application.load(Ordering::Relaxed),
            rejected_session: self.counters.rejected_session.load(Ordering::Relaxed),
            tracked_sessions,
            tracked_histories,
            app_bucket,
        }
    }
}

impl EvictionListener for RateLimiter {
    fn on_evict(&self, session_id: &str, _reason: EvictionReason) {
        self.forget(session_id);
    }
}
