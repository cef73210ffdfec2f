//! Resilience primitive benchmarks
//!
//! Admission checks sit on every request path, so they must stay cheap:
//! - Rate limiter: hot key, cold keys
//! - Circuit breaker: closed pass-through, open rejection
//! - Backoff: delay calculation
//!
//! Run with: `cargo bench --bench resilience_benchmarks`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use maprelay_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use maprelay_runtime::rate_limiter::{RateLimitConfig, RateLimitPreset, RateLimiter};
use maprelay_runtime::retry::RetryPolicy;
use std::time::Duration;

fn benchmark_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");
    group.throughput(Throughput::Elements(1));

    group.bench_function("hot_key", |b| {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig::new(u32::MAX, Duration::from_secs(60));
        b.iter(|| black_box(limiter.check(black_box("user-1"), &config)));
    });

    for keys in [100_usize, 10_000] {
        group.bench_with_input(BenchmarkId::new("spread_keys", keys), &keys, |b, &keys| {
            let limiter = RateLimiter::new();
            let ids: Vec<String> = (0..keys).map(|i| format!("user-{i}")).collect();
            let mut next = 0;
            b.iter(|| {
                let decision = limiter.check_preset(RateLimitPreset::Api, &ids[next % keys]);
                next += 1;
                black_box(decision)
            });
        });
    }

    group.finish();
}

fn benchmark_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    group.bench_function("closed_success", |b| {
        let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default());
        b.to_async(&runtime).iter(|| async {
            let _ = breaker.execute(|| async { Ok::<i32, String>(42) }).await;
        });
    });

    group.bench_function("open_rejection", |b| {
        let breaker = CircuitBreaker::new(
            "bench",
            CircuitBreakerConfig::builder()
                .failure_threshold(1)
                .reset_timeout(Duration::from_secs(3600))
                .build(),
        );
        runtime.block_on(async {
            let _ = breaker.execute(|| async { Err::<(), _>("down") }).await;
        });
        b.to_async(&runtime).iter(|| async {
            let _ = breaker.execute(|| async { Ok::<i32, String>(42) }).await;
        });
    });

    group.finish();
}

fn benchmark_backoff(c: &mut Criterion) {
    let policy = RetryPolicy::default();
    c.bench_function("retry_policy/delay_for_attempt", |b| {
        b.iter(|| black_box(policy.delay_for_attempt(black_box(4))));
    });
}

criterion_group!(
    benches,
    benchmark_rate_limiter,
    benchmark_circuit_breaker,
    benchmark_backoff
);
criterion_main!(benches);
