//! Circuit breaker: a call-gating state machine over sliding-window metrics
//!
//! The breaker opens once the failure rate or slow-call rate of recent
//! calls reaches its threshold, refuses calls while open, probes recovery
//! with a bounded set of half-open trials, and closes again when the
//! probes come back healthy. Permission checks never block.
//!
//! # Examples
//!
//! ```
//! use breakwater::{CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_rate_threshold(50.0)
//!     .sliding_window_count_based(10)
//!     .minimum_number_of_calls(10)
//!     .build()?;
//! let breaker = CircuitBreaker::of("backend", config)?;
//!
//! let reply = breaker
//!     .execute(|| async { Ok::<_, std::io::Error>("reply") })
//!     .await;
//! # Ok(())
//! # }
//! ```

mod config;
mod event;
mod state;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::core::clock::{Clock, SystemClock};
use crate::core::error::{ConfigResult, ExecuteError, ResilienceError, ResilienceResult};
use crate::core::event::EventPublisher;
use crate::metrics::Outcome;

pub use config::{CircuitBreakerConfig, CircuitBreakerConfigBuilder, ErrorPredicate, SlidingWindowType};
pub use event::{CircuitBreakerEvent, CircuitBreakerEventKind};
pub use state::{CircuitBreakerMetrics, State};

use state::StateMachine;

/// A named circuit breaker instance. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    machine: Arc<StateMachine>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration.
    pub fn of(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Create a breaker with default configuration.
    #[must_use]
    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::of(name, CircuitBreakerConfig::default())
            .expect("default circuit breaker config is valid")
    }

    /// Create a breaker deciding time through the given clock.
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            machine: StateMachine::new(name.into(), config, clock),
        })
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.machine.name()
    }

    /// The configuration the breaker was built with.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        self.machine.config()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> State {
        self.machine.state()
    }

    /// Metrics of the current state's window.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.machine.metrics()
    }

    /// Lifecycle event stream of this instance.
    #[must_use]
    pub fn event_publisher(&self) -> &EventPublisher<CircuitBreakerEvent> {
        self.machine.publisher()
    }

    /// Non-blocking permission check. A denial increments the
    /// not-permitted counter and never transitions the breaker, except
    /// that an elapsed open wait moves it to half-open first.
    #[must_use]
    pub fn try_acquire_permission(&self) -> bool {
        self.machine.try_acquire_permission().is_some()
    }

    /// Like [`try_acquire_permission`](Self::try_acquire_permission) but
    /// fails with [`ResilienceError::CallNotPermitted`] on denial.
    pub fn acquire_permission(&self) -> ResilienceResult<()> {
        if self.machine.try_acquire_permission().is_some() {
            Ok(())
        } else {
            Err(ResilienceError::call_not_permitted(
                self.name(),
                self.state().to_string(),
            ))
        }
    }

    /// Return an unconsumed half-open trial permit. Only meaningful on
    /// the ignored-error path; a no-op in every other state.
    pub fn release_permission(&self) {
        self.machine.release_permission();
    }

    /// Record a successful call of the given duration.
    pub fn on_success(&self, duration: Duration) {
        self.record_success(duration, self.machine.epoch());
    }

    /// Record a completed call that raised `error`. The configured
    /// predicates decide whether it counts as failure, success, or is
    /// ignored with the permission returned.
    pub fn on_error(&self, duration: Duration, error: &(dyn std::error::Error + 'static)) {
        self.classify_error(duration, error, self.machine.epoch());
    }

    /// Administrative transition to closed.
    pub fn transition_to_closed(&self) -> ResilienceResult<()> {
        self.machine.transition(State::Closed, None)
    }

    /// Administrative transition to open.
    pub fn transition_to_open(&self) -> ResilienceResult<()> {
        self.machine.transition(State::Open, None)
    }

    /// Administrative transition to half-open.
    pub fn transition_to_half_open(&self) -> ResilienceResult<()> {
        self.machine.transition(State::HalfOpen, None)
    }

    /// Stop gating and stop recording until transitioned out.
    pub fn transition_to_disabled(&self) -> ResilienceResult<()> {
        self.machine.transition(State::Disabled, None)
    }

    /// Refuse every call until transitioned out.
    pub fn transition_to_forced_open(&self) -> ResilienceResult<()> {
        self.machine.transition(State::ForcedOpen, None)
    }

    /// Keep recording but stop gating until transitioned out.
    pub fn transition_to_metrics_only(&self) -> ResilienceResult<()> {
        self.machine.transition(State::MetricsOnly, None)
    }

    /// Clear metrics and return to closed, from any state.
    pub fn reset(&self) {
        self.machine.reset();
    }

    /// Run `operation` under this breaker: acquire a permission, measure
    /// the call, record and classify its outcome. The user error is
    /// surfaced unchanged through [`ExecuteError::Inner`].
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let Some(epoch) = self.machine.try_acquire_permission() else {
            debug!(name = %self.name(), state = %self.state(), "call not permitted");
            return Err(ExecuteError::Rejected(ResilienceError::call_not_permitted(
                self.name(),
                self.state().to_string(),
            )));
        };
        let start = self.machine.clock().now();
        let result = operation().await;
        let duration = self.machine.clock().now().duration_since(start);
        self.settle(result, duration, epoch)
    }

    /// Blocking-closure variant of [`execute`](Self::execute).
    pub fn execute_sync<T, E, F>(&self, operation: F) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + 'static,
    {
        let Some(epoch) = self.machine.try_acquire_permission() else {
            return Err(ExecuteError::Rejected(ResilienceError::call_not_permitted(
                self.name(),
                self.state().to_string(),
            )));
        };
        let start = self.machine.clock().now();
        let result = operation();
        let duration = self.machine.clock().now().duration_since(start);
        self.settle(result, duration, epoch)
    }

    /// Wrap `operation` so every invocation runs under this breaker.
    pub fn decorate<T, E, F, Fut>(
        &self,
        operation: F,
    ) -> impl Fn() -> Pin<Box<dyn Future<Output = Result<T, ExecuteError<E>>> + Send>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        let breaker = self.clone();
        let operation = Arc::new(operation);
        move || {
            let breaker = breaker.clone();
            let operation = Arc::clone(&operation);
            Box::pin(async move { breaker.execute(|| (*operation)()).await })
        }
    }

    fn settle<T, E>(
        &self,
        result: Result<T, E>,
        duration: Duration,
        epoch: u64,
    ) -> Result<T, ExecuteError<E>>
    where
        E: std::error::Error + 'static,
    {
        match result {
            Ok(value) => {
                self.record_success(duration, epoch);
                Ok(value)
            }
            Err(error) => {
                self.classify_error(duration, &error, epoch);
                Err(ExecuteError::Inner(error))
            }
        }
    }

    fn record_success(&self, duration: Duration, epoch: u64) {
        self.machine.record(duration, Outcome::Success, epoch);
        self.publish(CircuitBreakerEventKind::Success { duration });
    }

    fn classify_error(
        &self,
        duration: Duration,
        error: &(dyn std::error::Error + 'static),
        epoch: u64,
    ) {
        let config = self.machine.config();
        if (config.ignore_error)(error) {
            self.machine.release_permission();
            self.publish(CircuitBreakerEventKind::IgnoredError {
                error: error.to_string(),
            });
        } else if (config.record_error)(error) {
            self.machine.record(duration, Outcome::Failure, epoch);
            self.publish(CircuitBreakerEventKind::Error {
                duration,
                error: error.to_string(),
            });
        } else {
            self.machine.record(duration, Outcome::Success, epoch);
            self.publish(CircuitBreakerEventKind::Success { duration });
        }
    }

    fn publish(&self, kind: CircuitBreakerEventKind) {
        let publisher = self.machine.publisher();
        if publisher.has_subscribers() {
            publisher.publish(&CircuitBreakerEvent::now(self.name(), kind));
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
