//! Watch a circuit breaker open, probe, and recover, with its event
//! stream printed as it happens.

use std::time::Duration;

use breakwater::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let breaker = CircuitBreaker::of(
        "orders",
        CircuitBreakerConfig::builder()
            .failure_rate_threshold(50.0)
            .sliding_window_count_based(4)
            .minimum_number_of_calls(4)
            .wait_duration_in_open_state(Duration::from_millis(500))
            .permitted_number_of_calls_in_half_open_state(2)
            .build()?,
    )?;

    breaker
        .event_publisher()
        .on_event(|event: &CircuitBreakerEvent| {
            println!("[{}] {}", event.name, event.kind.tag());
        });

    // Fail enough calls to open the breaker.
    for _ in 0..4 {
        let _ = breaker
            .execute(|| async { Err::<(), _>(std::io::Error::other("order service down")) })
            .await;
    }
    println!("state after failures: {}", breaker.state());

    // Denied while open.
    let denied = breaker
        .execute(|| async { Ok::<_, std::io::Error>("ignored") })
        .await;
    println!("while open: {denied:?}");

    // Wait out the open state, then recover through half-open probes.
    tokio::time::sleep(Duration::from_millis(600)).await;
    for _ in 0..2 {
        let probed = breaker
            .execute(|| async { Ok::<_, std::io::Error>("recovered") })
            .await;
        println!("probe: {probed:?}");
    }
    println!("state after probes: {}", breaker.state());

    Ok(())
}
