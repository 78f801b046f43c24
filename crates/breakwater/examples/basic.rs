//! Minimal tour of the four primitives guarding one flaky operation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use breakwater::prelude::*;

static CALLS: AtomicU32 = AtomicU32::new(0);

async fn flaky_backend() -> Result<String, std::io::Error> {
    let n = CALLS.fetch_add(1, Ordering::SeqCst) + 1;
    if n % 3 == 0 {
        Err(std::io::Error::other("backend hiccup"))
    } else {
        Ok(format!("reply #{n}"))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let breaker = CircuitBreaker::of(
        "backend",
        CircuitBreakerConfig::builder()
            .failure_rate_threshold(50.0)
            .sliding_window_count_based(10)
            .minimum_number_of_calls(10)
            .wait_duration_in_open_state(Duration::from_secs(2))
            .build()?,
    )?;
    let limiter = CycleRateLimiter::of(
        "backend",
        RateLimiterConfig::builder()
            .limit_for_period(20)
            .limit_refresh_period(Duration::from_secs(1))
            .timeout_duration(Duration::from_millis(200))
            .build()?,
    )?;
    let bulkhead = SemaphoreBulkhead::of(
        "backend",
        BulkheadConfig::builder()
            .max_concurrent_calls(4)
            .max_wait_duration(Duration::from_millis(100))
            .build()?,
    )?;
    let retry = Retry::of(
        "backend",
        RetryConfig::builder()
            .max_attempts(3)
            .interval_strategy(IntervalStrategy::exponential(Duration::from_millis(50), 2.0))
            .build()?,
    )?;

    for round in 0..10 {
        let result = retry
            .execute(|| async {
                if !limiter.acquire().await {
                    return Err(std::io::Error::other("rate limited"));
                }
                let _permit = match bulkhead.try_acquire_permission() {
                    Some(permit) => permit,
                    None => return Err(std::io::Error::other("bulkhead full")),
                };
                breaker
                    .execute(flaky_backend)
                    .await
                    .map_err(|e| std::io::Error::other(e.to_string()))
            })
            .await;
        println!("round {round}: {result:?}");
    }

    println!("breaker state: {}", breaker.state());
    println!("retry metrics: {:?}", retry.metrics());
    Ok(())
}
