//! Token bucket.

use crate::clock::SharedClock;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::time::Instant;

/// Slack for float drift in refill arithmetic; `60/N` seconds at `N/60`
/// tokens per second must yield a whole token.
const REFILL_EPSILON: f64 = 1e-9;

/// Unsynchronized bucket state. Callers provide the lock.
#[derive(Debug, Clone)]
pub struct BucketState {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

/// Point-in-time view of a bucket for reporting
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl BucketState {
    /// Full bucket holding `capacity` tokens
    pub fn new(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            capacity,
            refill_per_sec,
            tokens: capacity,
            last_refill: now,
            last_used: now,
        }
    }

    /// Bucket allowing `per_minute` requests per minute
    pub fn per_minute(per_minute: u32, now: Instant) -> Self {
        let capacity = f64::from(per_minute);
        Self::new(capacity, capacity / 60.0, now)
    }

    fn tokens_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_per_sec).min(self.capacity)
    }

    /// Bring the token count up to `now`
    pub fn refill(&mut self, now: Instant) {
        self.tokens = self.tokens_at(now);
        self.last_refill = now;
    }

    /// Whether `n` tokens are available. Call [`refill`](Self::refill) first.
    pub fn has(&self, n: f64) -> bool {
        self.tokens + REFILL_EPSILON >= n
    }

    /// Remove `n` tokens
    pub fn debit(&mut self, n: f64, now: Instant) {
        self.tokens = (self.tokens - n).max(0.0);
        self.last_used = now;
    }

    /// Refill, then debit `n` tokens if available. A refusal leaves the
    /// token count unchanged.
    pub fn try_consume(&mut self, n: f64, now: Instant) -> bool {
        self.refill(now);
        if !self.has(n) {
            return false;
        }
        self.debit(n, now);
        true
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn snapshot(&self, now: Instant) -> BucketSnapshot {
        BucketSnapshot {
            tokens: self.tokens_at(now),
            capacity: self.capacity,
            refill_per_sec: self.refill_per_sec,
        }
    }
}

/// Thread-safe token bucket.
///
/// The rate limiter's application bucket is one of these; it is also usable
/// on its own wherever a single shared budget is needed.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    clock: SharedClock,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            state: Mutex::new(BucketState::new(capacity, refill_per_sec, now)),
            clock,
        }
    }

    pub fn per_minute(per_minute: u32, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            state: Mutex::new(BucketState::per_minute(per_minute, now)),
            clock,
        }
    }

    /// Take `n` tokens if available
    pub fn consume(&self, n: f64) -> bool {
        let now = self.clock.now();
        self.state.lock().try_consume(n, now)
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        let now = self.clock.now();
        self.state.lock().snapshot(now)
    }

    /// Hold the bucket for a check that spans several locks. The caller
    /// refills and debits through the guard.
    pub(crate) fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_consume_until_empty() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::new(3.0, 1.0, clock.clone());
        assert!(bucket.consume(1.0));
        assert!(bucket.consume(2.0));
        assert!(!bucket.consume(1.0));
    }

    #[test]
    fn test_refusal_leaves_tokens_unchanged() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::new(5.0, 1.0, clock.clone());
        assert!(bucket.consume(3.0));
        assert!(!bucket.consume(4.0));
        assert_eq!(bucket.snapshot().tokens, 2.0);
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::new(2.0, 1.0, clock.clone());
        assert!(bucket.consume(2.0));
        clock.advance(Duration::from_secs(30));
        assert_eq!(bucket.snapshot().tokens, 2.0);
    }

    #[test]
    fn test_per_minute_refill_yields_whole_tokens() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::per_minute(7, clock.clone());
        for _ in 0..7 {
            assert!(bucket.consume(1.0));
        }
        assert!(!bucket.consume(1.0));
        clock.advance(Duration::from_secs_f64(60.0 / 7.0));
        assert!(bucket.consume(1.0));
        assert!(!bucket.consume(1.0));
    }

    #[test]
    fn test_concurrent_consumers_never_overdraw() {
        let clock = Arc::new(ManualClock::new());
        let bucket = Arc::new(TokenBucket::new(100.0, 0.0, clock));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                thread::spawn(move || (0..50).filter(|_| bucket.consume(1.0)).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 100);
    }
}
