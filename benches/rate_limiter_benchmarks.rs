//! Request-path benchmarks: rate-limit checks, bucket debits and scoped
//! session updates.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tabkeeper::clock;
use tabkeeper::config::RateLimitConfig;
use tabkeeper::session::{LineItem, SessionState};
use tabkeeper::{MemoryStore, RateLimiter, SessionStore, TokenBucket};

fn make_limiter() -> RateLimiter {
    // Limits high enough that every call takes the full allow path
    let config = RateLimitConfig {
        session_limit: u32::MAX,
        app_limit: u32::MAX,
        burst_limit: u32::MAX,
        ..RateLimitConfig::default()
    };
    RateLimiter::new(config, clock::system())
}

fn bench_check_limits_single_session(c: &mut Criterion) {
    let limiter = make_limiter();
    c.bench_function("check_limits_single_session", |b| {
        b.iter(|| limiter.check_limits(black_box("session-0")));
    });
}

fn bench_check_limits_many_sessions(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_limits_many_sessions");
    for &sessions in &[10usize, 100, 1_000] {
        let limiter = make_limiter();
        let ids: Vec<String> = (0..sessions).map(|i| format!("session-{i}")).collect();
        let mut next = 0usize;
        group.bench_with_input(BenchmarkId::from_parameter(sessions), &sessions, |b, _| {
            b.iter(|| {
                next = (next + 1) % ids.len();
                limiter.check_limits(&ids[next])
            });
        });
    }
    group.finish();
}

fn bench_token_bucket_consume(c: &mut Criterion) {
    let bucket = TokenBucket::new(1_000_000.0, 1_000_000.0, clock::system());
    c.bench_function("token_bucket_consume", |b| {
        b.iter(|| bucket.consume(black_box(1.0)));
    });
}

fn bench_scoped_updates(c: &mut Criterion) {
    let store = Arc::new(SessionStore::new(Arc::new(MemoryStore::new()), 1_000_000.0));
    let mut group = c.benchmark_group("scoped_updates");
    for &updates in &[1usize, 10] {
        let mut request = 0u64;
        group.bench_with_input(BenchmarkId::from_parameter(updates), &updates, |b, &n| {
            b.iter(|| {
                request += 1;
                let id = format!("bench-{}", request % 64);
                let mut scope = store.begin_request(&id);
                for _ in 0..n {
                    scope.advance_turn(false).ok();
                }
                scope.set_tip_percentage(15.0).ok();
                scope.finish()
            });
        });
    }
    group.finish();

    let mut session = store.session("direct");
    let mut added = 0u32;
    c.bench_function("direct_add_item", |b| {
        b.iter(|| {
            // Keep the history short so the clone cost stays flat
            added += 1;
            if added % 256 == 0 {
                store.reset("direct").ok();
            }
            session.add_item(LineItem::new("Espresso", 3.5)).ok();
            session.place_order().ok();
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .warm_up_time(Duration::from_secs(2));
    targets = bench_check_limits_single_session,
        bench_check_limits_many_sessions,
        bench_token_bucket_consume,
        bench_scoped_updates
}
criterion_main!(benches);
