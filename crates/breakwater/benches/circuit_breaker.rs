//! Benchmarks for the circuit breaker hot path
//!
//! Measures:
//! - try_acquire_permission() in the closed and open states
//! - outcome recording into the sliding window
//! - execute() with successful operations
//! - metrics snapshots

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use breakwater::{CircuitBreaker, CircuitBreakerConfig};

fn sized_config(window: usize) -> CircuitBreakerConfig {
    CircuitBreakerConfig::builder()
        .failure_rate_threshold(50.0)
        .sliding_window_count_based(window)
        .minimum_number_of_calls(window as u64)
        .wait_duration_in_open_state(Duration::from_secs(60))
        .build()
        .unwrap()
}

fn circuit_breaker_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker/acquire");

    group.bench_function("closed", |b| {
        let cb = CircuitBreaker::of("bench", sized_config(100)).unwrap();
        b.iter(|| black_box(cb.try_acquire_permission()));
    });

    group.bench_function("open", |b| {
        let cb = CircuitBreaker::of("bench", sized_config(100)).unwrap();
        cb.transition_to_forced_open().unwrap();
        b.iter(|| black_box(cb.try_acquire_permission()));
    });

    group.finish();
}

fn circuit_breaker_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker/record");

    for &window in &[10, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("on_success", window),
            &window,
            |b, &window| {
                let cb = CircuitBreaker::of("bench", sized_config(window)).unwrap();
                b.iter(|| cb.on_success(black_box(Duration::from_millis(5))));
            },
        );
    }

    group.finish();
}

fn circuit_breaker_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker/execute");

    group.bench_function("success", |b| {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let cb = CircuitBreaker::of("bench", sized_config(100)).unwrap();

        b.to_async(&rt).iter(|| async {
            let result = cb
                .execute(|| async { Ok::<_, std::io::Error>(black_box(42)) })
                .await;
            black_box(result)
        });
    });

    group.finish();
}

fn circuit_breaker_metrics(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker/metrics");

    group.bench_function("snapshot", |b| {
        let cb = CircuitBreaker::of("bench", sized_config(100)).unwrap();
        for _ in 0..50 {
            cb.on_success(Duration::from_millis(3));
        }
        b.iter(|| black_box(cb.metrics()));
    });

    group.finish();
}

criterion_group!(
    benches,
    circuit_breaker_acquire,
    circuit_breaker_record,
    circuit_breaker_execute,
    circuit_breaker_metrics,
);

criterion_main!(benches);
