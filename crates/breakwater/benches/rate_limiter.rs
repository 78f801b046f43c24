//! Benchmarks for the permit schedulers
//!
//! Measures:
//! - try_acquire_permission() on both limiter variants
//! - the reservation step under contention
//! - metrics projection

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;

use breakwater::{
    CycleRateLimiter, RateLimiter, RateLimiterConfig, RefillRateLimiter, RefillRateLimiterConfig,
};

fn wide_open_cycle() -> CycleRateLimiter {
    CycleRateLimiter::of(
        "bench",
        RateLimiterConfig::builder()
            .limit_for_period(1_000_000)
            .limit_refresh_period(Duration::from_millis(1))
            .timeout_duration(Duration::ZERO)
            .build()
            .unwrap(),
    )
    .unwrap()
}

fn rate_limiter_try_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter/try_acquire");

    group.bench_function("cycle", |b| {
        let limiter = wide_open_cycle();
        b.iter(|| black_box(limiter.try_acquire_permission(1)));
    });

    group.bench_function("refill", |b| {
        let limiter = RefillRateLimiter::of(
            "bench",
            RefillRateLimiterConfig::builder()
                .limit_for_period(1_000_000)
                .limit_refresh_period(Duration::from_millis(1))
                .timeout_duration(Duration::ZERO)
                .build()
                .unwrap(),
        )
        .unwrap();
        b.iter(|| black_box(limiter.try_acquire_permission(1)));
    });

    group.finish();
}

fn rate_limiter_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter/contended");

    group.bench_function("cycle_8_threads", |b| {
        let limiter = Arc::new(wide_open_cycle());
        b.iter(|| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let limiter = Arc::clone(&limiter);
                    std::thread::spawn(move || {
                        for _ in 0..100 {
                            black_box(limiter.try_acquire_permission(1));
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });

    group.finish();
}

fn rate_limiter_metrics(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter/metrics");

    group.bench_function("projection", |b| {
        let limiter = wide_open_cycle();
        b.iter(|| black_box(limiter.metrics()));
    });

    group.finish();
}

criterion_group!(
    benches,
    rate_limiter_try_acquire,
    rate_limiter_contended,
    rate_limiter_metrics,
);

criterion_main!(benches);
