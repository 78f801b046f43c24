#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
//! # Breakwater
//!
//! In-process fault-tolerance primitives that surround arbitrary
//! computations with policies governing whether, when, and how they may
//! execute:
//!
//! - [`CircuitBreaker`]: opens after observed failure or latency crosses
//!   thresholds over a sliding window of recent calls
//! - [`CycleRateLimiter`] / [`RefillRateLimiter`]: admit at most N permits
//!   per refresh period, optionally letting callers wait
//! - [`SemaphoreBulkhead`] / [`TaskPoolBulkhead`]: cap in-flight calls,
//!   with bounded wait or a bounded queue
//! - [`AdaptiveBulkhead`]: AIMD control loop over a bulkhead's limit
//! - [`Retry`]: re-invokes failed computations on a backoff schedule
//!
//! Primitives compose by wrapping each other and share the sliding-window
//! metrics, event publisher, and registry substrates. User errors always
//! pass through unchanged; the primitives' own refusals surface as
//! [`ResilienceError`].
//!
//! ```
//! use breakwater::prelude::*;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::of(
//!     "backend",
//!     CircuitBreakerConfig::builder()
//!         .failure_rate_threshold(50.0)
//!         .sliding_window_count_based(20)
//!         .minimum_number_of_calls(10)
//!         .wait_duration_in_open_state(Duration::from_secs(5))
//!         .build()?,
//! )?;
//! let retry = Retry::of_defaults("backend");
//!
//! let reply: Result<&str, _> = retry
//!     .execute(|| async {
//!         breaker
//!             .execute(|| async { Ok::<_, std::io::Error>("reply") })
//!             .await
//!     })
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod metrics;
pub mod patterns;
mod registry;

pub use crate::core::{
    Clock, ConfigError, ConfigResult, ErrorClass, EventPublisher, ExecuteError, MockClock,
    ResilienceConfig, ResilienceError, ResilienceResult, SystemClock,
};
pub use crate::metrics::{Outcome, Snapshot, ThresholdCheck, Window, WindowSettings};
pub use crate::patterns::bulkhead::{
    AdaptiveBulkhead, AdaptiveBulkheadConfig, AdaptiveBulkheadEvent, AdaptiveBulkheadEventKind,
    AdaptiveBulkheadMetrics, AdaptiveState, BulkheadConfig, BulkheadEvent, BulkheadEventKind,
    BulkheadMetrics, BulkheadPermit, CompletionHandle, SemaphoreBulkhead, TaskPoolBulkhead,
    TaskPoolBulkheadConfig, TaskPoolBulkheadMetrics,
};
pub use crate::patterns::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent, CircuitBreakerEventKind,
    CircuitBreakerMetrics, ErrorPredicate, SlidingWindowType, State,
};
pub use crate::patterns::rate_limiter::{
    CycleRateLimiter, RateLimiter, RateLimiterConfig, RateLimiterEvent, RateLimiterEventKind,
    RateLimiterMetrics, RefillRateLimiter, RefillRateLimiterConfig,
};
pub use crate::patterns::retry::{
    IntervalStrategy, Retry, RetryConfig, RetryEvent, RetryEventKind, RetryMetrics,
};
pub use crate::patterns::timeout::{timeout, timeout_with_error};
pub use crate::registry::{
    AdaptiveBulkheadRegistry, BulkheadRegistry, CircuitBreakerRegistry, PatternRegistry,
    RateLimiterRegistry, RetryRegistry, TaskPoolBulkheadRegistry,
};

/// The types most guarded call sites need.
pub mod prelude {
    pub use crate::core::{ExecuteError, ResilienceError, ResilienceResult};
    pub use crate::patterns::bulkhead::{
        AdaptiveBulkhead, AdaptiveBulkheadConfig, BulkheadConfig, SemaphoreBulkhead,
        TaskPoolBulkhead, TaskPoolBulkheadConfig,
    };
    pub use crate::patterns::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, State};
    pub use crate::patterns::rate_limiter::{
        CycleRateLimiter, RateLimiter, RateLimiterConfig, RefillRateLimiter,
    };
    pub use crate::patterns::retry::{IntervalStrategy, Retry, RetryConfig};
    pub use crate::patterns::timeout::timeout;
    pub use crate::registry::{
        BulkheadRegistry, CircuitBreakerRegistry, RateLimiterRegistry, RetryRegistry,
    };
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
