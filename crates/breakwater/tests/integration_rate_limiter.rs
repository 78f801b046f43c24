//! End-to-end rate limiter scenarios
//!
//! Covers burst admission, per-period permit accounting under concurrent
//! load, wait-bounded denials, and the refill variant's pacing.

use breakwater::{
    CycleRateLimiter, MockClock, RateLimiter, RateLimiterConfig, RefillRateLimiter,
    RefillRateLimiterConfig,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Burst of 11 against limit 10 per minute: the first ten are granted,
/// the eleventh is denied within the 100ms timeout.
#[tokio::test]
async fn burst_beyond_limit_is_denied_within_timeout() {
    let limiter = CycleRateLimiter::of(
        "burst",
        RateLimiterConfig::builder()
            .limit_for_period(10)
            .limit_refresh_period(Duration::from_secs(60))
            .timeout_duration(Duration::from_millis(100))
            .build()
            .unwrap(),
    )
    .unwrap();

    for call in 0..10 {
        assert!(limiter.acquire_permission(1).await, "call #{call} denied");
    }

    let started = Instant::now();
    assert!(!limiter.acquire_permission(1).await);
    assert!(started.elapsed() <= Duration::from_millis(150));
}

/// Across any single refresh period, granted permits never exceed the
/// period limit, no matter how many tasks compete.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_grants_stay_within_the_period_limit() {
    let limiter = Arc::new(CycleRateLimiter::of(
        "contended",
        RateLimiterConfig::builder()
            .limit_for_period(25)
            .limit_refresh_period(Duration::from_secs(60))
            .timeout_duration(Duration::ZERO)
            .build()
            .unwrap(),
    )
    .unwrap());
    let granted = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let granted = Arc::clone(&granted);
            tokio::spawn(async move {
                if limiter.acquire_permission(1).await {
                    granted.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    futures::future::join_all(handles).await;

    assert_eq!(granted.load(Ordering::SeqCst), 25);
}

/// A granted acquire never waits past the configured timeout.
#[tokio::test]
async fn granted_waits_stay_within_timeout() {
    let limiter = CycleRateLimiter::of(
        "paced",
        RateLimiterConfig::builder()
            .limit_for_period(2)
            .limit_refresh_period(Duration::from_millis(100))
            .timeout_duration(Duration::from_millis(250))
            .build()
            .unwrap(),
    )
    .unwrap();

    // Burn the current cycle, then wait into the next one.
    assert!(limiter.acquire_permission(2).await);
    let started = Instant::now();
    assert!(limiter.acquire_permission(1).await);
    assert!(started.elapsed() <= Duration::from_millis(250));
}

/// Cycle turnover replenishes exactly one period's worth of permits.
#[test]
fn cycle_turnover_replenishes_the_limit() {
    let clock = MockClock::new();
    let limiter = CycleRateLimiter::with_clock(
        "cycles",
        RateLimiterConfig::builder()
            .limit_for_period(5)
            .limit_refresh_period(Duration::from_secs(1))
            .timeout_duration(Duration::ZERO)
            .build()
            .unwrap(),
        Arc::new(clock.clone()),
    )
    .unwrap();

    for _ in 0..5 {
        assert!(limiter.try_acquire_permission(1));
    }
    assert!(!limiter.try_acquire_permission(1));

    // Several idle cycles still cap the balance at one period.
    clock.advance(Duration::from_secs(10));
    assert_eq!(limiter.metrics().available_permissions, 5);
    for _ in 0..5 {
        assert!(limiter.try_acquire_permission(1));
    }
    assert!(!limiter.try_acquire_permission(1));
}

/// Reservations drive the balance negative and price the wait by whole
/// future cycles.
#[test]
fn reservations_price_future_cycles() {
    let clock = MockClock::new();
    let limiter = CycleRateLimiter::with_clock(
        "reserving",
        RateLimiterConfig::builder()
            .limit_for_period(2)
            .limit_refresh_period(Duration::from_secs(1))
            .timeout_duration(Duration::from_secs(30))
            .build()
            .unwrap(),
        Arc::new(clock.clone()),
    )
    .unwrap();

    assert!(limiter.try_acquire_permission(2));
    let wait = limiter.reserve_permission(2).unwrap();
    assert!(wait <= Duration::from_secs(1));
    assert_eq!(limiter.metrics().available_permissions, -2);

    // After the reserved cycle arrives the backlog is repaid.
    clock.advance(Duration::from_secs(1));
    assert_eq!(limiter.metrics().available_permissions, 0);
}

/// The refill variant paces permits linearly rather than per cycle.
#[test]
fn refill_paces_linearly() {
    let clock = MockClock::new();
    let limiter = RefillRateLimiter::with_clock(
        "refill",
        RefillRateLimiterConfig::builder()
            .limit_for_period(10)
            .limit_refresh_period(Duration::from_secs(1))
            .timeout_duration(Duration::ZERO)
            .initial_permits(0)
            .build()
            .unwrap(),
        Arc::new(clock.clone()),
    )
    .unwrap();

    assert!(!limiter.try_acquire_permission(1));
    clock.advance(Duration::from_millis(100));
    assert!(limiter.try_acquire_permission(1));
    assert!(!limiter.try_acquire_permission(1));

    clock.advance(Duration::from_millis(500));
    assert_eq!(limiter.metrics().available_permissions, 5);
}

/// Denied callers consume nothing: the same permits remain grantable to
/// the next caller.
#[test]
fn denial_leaves_the_balance_intact() {
    let limiter = CycleRateLimiter::of(
        "intact",
        RateLimiterConfig::builder()
            .limit_for_period(3)
            .limit_refresh_period(Duration::from_secs(60))
            .timeout_duration(Duration::ZERO)
            .build()
            .unwrap(),
    )
    .unwrap();

    assert!(limiter.try_acquire_permission(2));
    // Requesting more than remains is denied without touching the one
    // remaining permit.
    assert!(!limiter.try_acquire_permission(2));
    assert!(limiter.try_acquire_permission(1));
}
