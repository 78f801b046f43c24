//! Adaptive bulkhead: an AIMD control loop over the concurrency limit
//!
//! Wraps a [`SemaphoreBulkhead`] whose limit it retunes from observed
//! outcomes, TCP-style. In `SlowStart` the limit grows multiplicatively
//! while rates stay healthy; the first threshold crossing decreases it
//! multiplicatively and drops the loop into `CongestionAvoidance`, where
//! growth is additive. Bottoming out at the minimum limit signals the
//! congestion has cleared and re-enters `SlowStart`. The metrics window
//! resets on every limit change and on both state switches, so no regime
//! carries stale calls into the next.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

use crate::core::clock::{Clock, SystemClock};
use crate::core::error::{ConfigError, ConfigResult, ExecuteError, ResilienceError};
use crate::core::event::EventPublisher;
use crate::metrics::{Outcome, Snapshot, ThresholdCheck, Window, WindowSettings};
use crate::patterns::circuit_breaker::{ErrorPredicate, SlidingWindowType};

use super::semaphore::{BulkheadPermit, SemaphoreBulkhead};
use super::BulkheadConfig;

fn record_all() -> ErrorPredicate {
    Arc::new(|_| true)
}

fn ignore_none() -> ErrorPredicate {
    Arc::new(|_| false)
}

/// Control state of the adaptive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptiveState {
    /// Multiplicative increase while below thresholds
    SlowStart,
    /// Additive increase, multiplicative decrease
    CongestionAvoidance,
}

impl std::fmt::Display for AdaptiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SlowStart => write!(f, "slow-start"),
            Self::CongestionAvoidance => write!(f, "congestion-avoidance"),
        }
    }
}

/// Adaptive bulkhead configuration. Immutable once built.
#[derive(Clone, Serialize, Deserialize)]
pub struct AdaptiveBulkheadConfig {
    /// Floor of the concurrency limit
    pub min_concurrent_calls: usize,
    /// Ceiling of the concurrency limit
    pub max_concurrent_calls: usize,
    /// Limit at construction
    pub initial_concurrent_calls: usize,
    /// Slow-start growth factor
    pub increase_multiplier: f32,
    /// Congestion-avoidance growth step
    pub increase_summand: usize,
    /// Shrink factor on threshold crossings
    pub decrease_multiplier: f32,
    /// Longest a caller may wait for a permit
    #[serde(with = "humantime_serde")]
    pub max_wait_duration: Duration,
    /// Failure percentage treated as congestion
    pub failure_rate_threshold: f32,
    /// Slow-call percentage treated as congestion
    pub slow_call_rate_threshold: f32,
    /// Calls at or over this duration classify as slow
    #[serde(with = "humantime_serde")]
    pub slow_call_duration_threshold: Duration,
    /// Samples required before the loop reacts
    pub minimum_number_of_calls: u64,
    /// Count-based or time-based outcome aggregation
    pub sliding_window_type: SlidingWindowType,
    /// N slots or N seconds
    pub sliding_window_size: usize,
    /// Which user errors count as failures
    #[serde(skip, default = "record_all")]
    pub record_error: ErrorPredicate,
    /// Which user errors neither fail nor succeed
    #[serde(skip, default = "ignore_none")]
    pub ignore_error: ErrorPredicate,
}

impl Default for AdaptiveBulkheadConfig {
    fn default() -> Self {
        Self {
            min_concurrent_calls: 2,
            max_concurrent_calls: 25,
            initial_concurrent_calls: 2,
            increase_multiplier: 2.0,
            increase_summand: 1,
            decrease_multiplier: 0.5,
            max_wait_duration: Duration::ZERO,
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 50.0,
            slow_call_duration_threshold: Duration::from_secs(5),
            minimum_number_of_calls: 100,
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            record_error: record_all(),
            ignore_error: ignore_none(),
        }
    }
}

impl std::fmt::Debug for AdaptiveBulkheadConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveBulkheadConfig")
            .field("min_concurrent_calls", &self.min_concurrent_calls)
            .field("max_concurrent_calls", &self.max_concurrent_calls)
            .field("initial_concurrent_calls", &self.initial_concurrent_calls)
            .field("increase_multiplier", &self.increase_multiplier)
            .field("increase_summand", &self.increase_summand)
            .field("decrease_multiplier", &self.decrease_multiplier)
            .field("failure_rate_threshold", &self.failure_rate_threshold)
            .field("slow_call_rate_threshold", &self.slow_call_rate_threshold)
            .field("minimum_number_of_calls", &self.minimum_number_of_calls)
            .finish_non_exhaustive()
    }
}

impl AdaptiveBulkheadConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> AdaptiveBulkheadConfigBuilder {
        AdaptiveBulkheadConfigBuilder::default()
    }

    /// Validate field ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.min_concurrent_calls == 0 {
            return Err(ConfigError::validation(
                "min_concurrent_calls must be at least 1",
            ));
        }
        if self.max_concurrent_calls < self.min_concurrent_calls {
            return Err(ConfigError::validation(
                "max_concurrent_calls must be at least min_concurrent_calls",
            ));
        }
        if self.initial_concurrent_calls < self.min_concurrent_calls
            || self.initial_concurrent_calls > self.max_concurrent_calls
        {
            return Err(ConfigError::validation(
                "initial_concurrent_calls must lie within [min, max]",
            ));
        }
        if self.increase_multiplier <= 1.0 {
            return Err(ConfigError::validation(
                "increase_multiplier must be greater than 1",
            ));
        }
        if !(self.decrease_multiplier > 0.0 && self.decrease_multiplier < 1.0) {
            return Err(ConfigError::validation(
                "decrease_multiplier must be in (0, 1)",
            ));
        }
        if self.increase_summand == 0 {
            return Err(ConfigError::validation("increase_summand must be at least 1"));
        }
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0)
            || !(self.slow_call_rate_threshold > 0.0 && self.slow_call_rate_threshold <= 100.0)
        {
            return Err(ConfigError::validation(
                "rate thresholds must be in (0, 100]",
            ));
        }
        if self.minimum_number_of_calls == 0 || self.sliding_window_size == 0 {
            return Err(ConfigError::validation(
                "minimum_number_of_calls and sliding_window_size must be at least 1",
            ));
        }
        Ok(())
    }
}

impl crate::core::config::ResilienceConfig for AdaptiveBulkheadConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.validate()
    }
}

/// Builder for [`AdaptiveBulkheadConfig`].
#[derive(Default)]
pub struct AdaptiveBulkheadConfigBuilder {
    config: AdaptiveBulkheadConfig,
}

impl AdaptiveBulkheadConfigBuilder {
    /// Floor of the concurrency limit.
    #[must_use]
    pub fn min_concurrent_calls(mut self, min: usize) -> Self {
        self.config.min_concurrent_calls = min;
        self
    }

    /// Ceiling of the concurrency limit.
    #[must_use]
    pub fn max_concurrent_calls(mut self, max: usize) -> Self {
        self.config.max_concurrent_calls = max;
        self
    }

    /// Limit at construction.
    #[must_use]
    pub fn initial_concurrent_calls(mut self, initial: usize) -> Self {
        self.config.initial_concurrent_calls = initial;
        self
    }

    /// Slow-start growth factor.
    #[must_use]
    pub fn increase_multiplier(mut self, multiplier: f32) -> Self {
        self.config.increase_multiplier = multiplier;
        self
    }

    /// Congestion-avoidance growth step.
    #[must_use]
    pub fn increase_summand(mut self, summand: usize) -> Self {
        self.config.increase_summand = summand;
        self
    }

    /// Shrink factor on threshold crossings.
    #[must_use]
    pub fn decrease_multiplier(mut self, multiplier: f32) -> Self {
        self.config.decrease_multiplier = multiplier;
        self
    }

    /// Longest a caller may wait for a permit.
    #[must_use]
    pub fn max_wait_duration(mut self, wait: Duration) -> Self {
        self.config.max_wait_duration = wait;
        self
    }

    /// Failure percentage treated as congestion.
    #[must_use]
    pub fn failure_rate_threshold(mut self, threshold: f32) -> Self {
        self.config.failure_rate_threshold = threshold;
        self
    }

    /// Slow-call percentage treated as congestion.
    #[must_use]
    pub fn slow_call_rate_threshold(mut self, threshold: f32) -> Self {
        self.config.slow_call_rate_threshold = threshold;
        self
    }

    /// Duration at or over which a call classifies as slow.
    #[must_use]
    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    /// Samples required before the loop reacts.
    #[must_use]
    pub fn minimum_number_of_calls(mut self, calls: u64) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    /// Use a count-based window of `size` calls.
    #[must_use]
    pub fn sliding_window_count_based(mut self, size: usize) -> Self {
        self.config.sliding_window_type = SlidingWindowType::CountBased;
        self.config.sliding_window_size = size;
        self
    }

    /// Use a time-based window of `seconds` seconds.
    #[must_use]
    pub fn sliding_window_time_based(mut self, seconds: usize) -> Self {
        self.config.sliding_window_type = SlidingWindowType::TimeBased;
        self.config.sliding_window_size = seconds;
        self
    }

    /// Errors matching the predicate are recorded as failures.
    #[must_use]
    pub fn record_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.record_error = Arc::new(predicate);
        self
    }

    /// Errors matching the predicate are ignored.
    #[must_use]
    pub fn ignore_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.ignore_error = Arc::new(predicate);
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> ConfigResult<AdaptiveBulkheadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// One lifecycle event of one adaptive bulkhead instance.
#[derive(Debug, Clone)]
pub struct AdaptiveBulkheadEvent {
    /// Instance name
    pub name: String,
    /// Wall-clock publication time
    pub timestamp: SystemTime,
    /// What happened
    pub kind: AdaptiveBulkheadEventKind,
}

/// Event discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptiveBulkheadEventKind {
    /// A call was recorded as a success
    CallSucceeded,
    /// A call was recorded as a failure
    CallFailed,
    /// A call raised an error the configuration ignores
    CallIgnored,
    /// The control loop raised the concurrency limit
    LimitIncreased {
        /// Limit now in force
        new_limit: usize,
    },
    /// The control loop lowered the concurrency limit
    LimitDecreased {
        /// Limit now in force
        new_limit: usize,
    },
    /// The control loop changed regime
    StateTransition {
        /// Regime before the switch
        from: AdaptiveState,
        /// Regime after the switch
        to: AdaptiveState,
    },
}

/// Point-in-time metrics of one adaptive bulkhead.
#[derive(Debug, Clone)]
pub struct AdaptiveBulkheadMetrics {
    /// Control regime
    pub state: AdaptiveState,
    /// Concurrency limit currently in force
    pub max_allowed_concurrent_calls: usize,
    /// Permits currently free
    pub available_concurrent_calls: usize,
    /// Aggregated outcomes of the current window
    pub calls: Snapshot,
}

struct AdaptiveInner {
    name: String,
    config: AdaptiveBulkheadConfig,
    bulkhead: SemaphoreBulkhead,
    window: Window,
    state: Mutex<AdaptiveState>,
    publisher: EventPublisher<AdaptiveBulkheadEvent>,
}

/// A named adaptive bulkhead. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AdaptiveBulkhead {
    inner: Arc<AdaptiveInner>,
}

impl AdaptiveBulkhead {
    /// Create an adaptive bulkhead with the given configuration.
    pub fn of(name: impl Into<String>, config: AdaptiveBulkheadConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Create an adaptive bulkhead with default configuration.
    #[must_use]
    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::of(name, AdaptiveBulkheadConfig::default())
            .expect("default adaptive bulkhead config is valid")
    }

    /// Create an adaptive bulkhead deciding time through the given clock.
    pub fn with_clock(
        name: impl Into<String>,
        config: AdaptiveBulkheadConfig,
        clock: Arc<dyn Clock>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let name = name.into();
        let bulkhead = SemaphoreBulkhead::of(
            name.clone(),
            BulkheadConfig {
                max_concurrent_calls: config.initial_concurrent_calls,
                max_wait_duration: config.max_wait_duration,
            },
        )?;
        let settings = WindowSettings {
            minimum_number_of_calls: config.minimum_number_of_calls,
            slow_call_duration_threshold: config.slow_call_duration_threshold,
            failure_rate_threshold: config.failure_rate_threshold,
            slow_call_rate_threshold: config.slow_call_rate_threshold,
        };
        let window = match config.sliding_window_type {
            SlidingWindowType::CountBased => {
                Window::count_based(config.sliding_window_size, settings, Arc::clone(&clock))
            }
            SlidingWindowType::TimeBased => {
                Window::time_based(config.sliding_window_size, settings, Arc::clone(&clock))
            }
        };
        Ok(Self {
            inner: Arc::new(AdaptiveInner {
                name,
                config,
                bulkhead,
                window,
                state: Mutex::new(AdaptiveState::SlowStart),
                publisher: EventPublisher::new(),
            }),
        })
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configuration the bulkhead was built with.
    #[must_use]
    pub fn config(&self) -> &AdaptiveBulkheadConfig {
        &self.inner.config
    }

    /// Control regime the loop is currently in.
    #[must_use]
    pub fn state(&self) -> AdaptiveState {
        *self.inner.state.lock()
    }

    /// Lifecycle event stream of this instance.
    #[must_use]
    pub fn event_publisher(&self) -> &EventPublisher<AdaptiveBulkheadEvent> {
        &self.inner.publisher
    }

    /// Current regime, limit, availability, and window totals.
    #[must_use]
    pub fn metrics(&self) -> AdaptiveBulkheadMetrics {
        let inner_metrics = self.inner.bulkhead.metrics();
        AdaptiveBulkheadMetrics {
            state: self.state(),
            max_allowed_concurrent_calls: inner_metrics.max_allowed_concurrent_calls,
            available_concurrent_calls: inner_metrics.available_concurrent_calls,
            calls: self.inner.window.snapshot(),
        }
    }

    /// Acquire a permit without waiting.
    #[must_use]
    pub fn try_acquire_permission(&self) -> Option<BulkheadPermit> {
        self.inner.bulkhead.try_acquire_permission()
    }

    /// Acquire a permit, waiting up to `max_wait_duration`.
    pub async fn acquire_permission(&self) -> Result<BulkheadPermit, ResilienceError> {
        self.inner.bulkhead.acquire_permission().await
    }

    /// Record a successful call and let the control loop react.
    pub fn on_success(&self, duration: Duration) {
        let check = self.inner.window.record(duration, Outcome::Success);
        self.publish(AdaptiveBulkheadEventKind::CallSucceeded);
        self.adapt(check);
    }

    /// Record a completed call that raised `error`. Ignored errors adapt
    /// nothing; unrecorded errors count as success.
    pub fn on_error(&self, duration: Duration, error: &(dyn std::error::Error + 'static)) {
        let config = &self.inner.config;
        if (config.ignore_error)(error) {
            self.publish(AdaptiveBulkheadEventKind::CallIgnored);
            return;
        }
        let outcome = if (config.record_error)(error) {
            self.publish(AdaptiveBulkheadEventKind::CallFailed);
            Outcome::Failure
        } else {
            self.publish(AdaptiveBulkheadEventKind::CallSucceeded);
            Outcome::Success
        };
        let check = self.inner.window.record(duration, outcome);
        self.adapt(check);
    }

    /// Administrative switch to slow start. Resets the window.
    pub fn transition_to_slow_start(&self) {
        let mut state = self.inner.state.lock();
        let from = *state;
        *state = AdaptiveState::SlowStart;
        drop(state);
        if from != AdaptiveState::SlowStart {
            self.after_transition(from, AdaptiveState::SlowStart);
        }
    }

    /// Administrative switch to congestion avoidance. Resets the window.
    pub fn transition_to_congestion_avoidance(&self) {
        let mut state = self.inner.state.lock();
        let from = *state;
        *state = AdaptiveState::CongestionAvoidance;
        drop(state);
        if from != AdaptiveState::CongestionAvoidance {
            self.after_transition(from, AdaptiveState::CongestionAvoidance);
        }
    }

    /// Run `operation` holding one permit, recording its outcome into the
    /// control loop.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let permit = self
            .acquire_permission()
            .await
            .map_err(ExecuteError::Rejected)?;
        let started = std::time::Instant::now();
        let result = operation().await;
        let duration = started.elapsed();
        drop(permit);
        match result {
            Ok(value) => {
                self.on_success(duration);
                Ok(value)
            }
            Err(error) => {
                self.on_error(duration, &error);
                Err(ExecuteError::Inner(error))
            }
        }
    }

    /// One AIMD step.
    fn adapt(&self, check: ThresholdCheck) {
        if check == ThresholdCheck::BelowMinimumCalls {
            return;
        }
        let congested = check == ThresholdCheck::AboveThresholds;
        let limit = self.current_limit();
        let config = &self.inner.config;

        let mut state = self.inner.state.lock();
        match (*state, congested) {
            (AdaptiveState::SlowStart, false) => {
                drop(state);
                self.change_limit(multiply(limit, config.increase_multiplier, config));
            }
            (AdaptiveState::SlowStart, true) => {
                *state = AdaptiveState::CongestionAvoidance;
                drop(state);
                self.change_limit(multiply(limit, config.decrease_multiplier, config));
                self.after_transition(AdaptiveState::SlowStart, AdaptiveState::CongestionAvoidance);
            }
            (AdaptiveState::CongestionAvoidance, false) => {
                if limit == config.min_concurrent_calls {
                    // The previous decrease bottomed out; congestion is
                    // over, probe aggressively again.
                    *state = AdaptiveState::SlowStart;
                    drop(state);
                    self.after_transition(
                        AdaptiveState::CongestionAvoidance,
                        AdaptiveState::SlowStart,
                    );
                } else {
                    drop(state);
                    let grown = (limit + config.increase_summand).min(config.max_concurrent_calls);
                    self.change_limit(grown);
                }
            }
            (AdaptiveState::CongestionAvoidance, true) => {
                drop(state);
                self.change_limit(multiply(limit, config.decrease_multiplier, config));
            }
        }
    }

    fn current_limit(&self) -> usize {
        self.inner.bulkhead.config().max_concurrent_calls
    }

    fn change_limit(&self, new_limit: usize) {
        let old_limit = self.current_limit();
        if new_limit == old_limit {
            return;
        }
        let result = self.inner.bulkhead.change_config(BulkheadConfig {
            max_concurrent_calls: new_limit,
            max_wait_duration: self.inner.config.max_wait_duration,
        });
        debug_assert!(result.is_ok(), "adapted limit is always at least 1");
        debug!(name = %self.inner.name, old_limit, new_limit, "adaptive limit changed");
        self.inner.window.reset();
        let kind = if new_limit > old_limit {
            AdaptiveBulkheadEventKind::LimitIncreased { new_limit }
        } else {
            AdaptiveBulkheadEventKind::LimitDecreased { new_limit }
        };
        self.publish(kind);
    }

    fn after_transition(&self, from: AdaptiveState, to: AdaptiveState) {
        self.inner.window.reset();
        self.publish(AdaptiveBulkheadEventKind::StateTransition { from, to });
    }

    fn publish(&self, kind: AdaptiveBulkheadEventKind) {
        if self.inner.publisher.has_subscribers() {
            self.inner.publisher.publish(&AdaptiveBulkheadEvent {
                name: self.inner.name.clone(),
                timestamp: SystemTime::now(),
                kind,
            });
        }
    }
}

impl std::fmt::Debug for AdaptiveBulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveBulkhead")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn multiply(limit: usize, factor: f32, config: &AdaptiveBulkheadConfig) -> usize {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let scaled = (limit as f32 * factor).round() as usize;
    scaled.clamp(config.min_concurrent_calls, config.max_concurrent_calls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn config(min: usize, max: usize, initial: usize, min_calls: u64) -> AdaptiveBulkheadConfig {
        AdaptiveBulkheadConfig::builder()
            .min_concurrent_calls(min)
            .max_concurrent_calls(max)
            .initial_concurrent_calls(initial)
            .minimum_number_of_calls(min_calls)
            .sliding_window_count_based(min_calls as usize)
            .slow_call_duration_threshold(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    fn fast() -> Duration {
        Duration::from_millis(10)
    }

    fn failure() -> io::Error {
        io::Error::other("downstream overloaded")
    }

    fn feed_successes(bulkhead: &AdaptiveBulkhead, count: u64) {
        for _ in 0..count {
            bulkhead.on_success(fast());
        }
    }

    fn feed_failures(bulkhead: &AdaptiveBulkhead, count: u64) {
        for _ in 0..count {
            bulkhead.on_error(fast(), &failure());
        }
    }

    #[test]
    fn test_slow_start_doubles_the_limit() {
        let bulkhead = AdaptiveBulkhead::of("adaptive", config(2, 64, 2, 4)).unwrap();
        assert_eq!(bulkhead.state(), AdaptiveState::SlowStart);

        feed_successes(&bulkhead, 4);
        assert_eq!(bulkhead.metrics().max_allowed_concurrent_calls, 4);

        feed_successes(&bulkhead, 4);
        assert_eq!(bulkhead.metrics().max_allowed_concurrent_calls, 8);
    }

    #[test]
    fn test_growth_is_capped_at_max() {
        let bulkhead = AdaptiveBulkhead::of("adaptive", config(2, 6, 4, 4)).unwrap();
        feed_successes(&bulkhead, 4);
        assert_eq!(bulkhead.metrics().max_allowed_concurrent_calls, 6);
    }

    #[test]
    fn test_congestion_switches_regime_and_halves_the_limit() {
        let bulkhead = AdaptiveBulkhead::of("adaptive", config(2, 64, 16, 4)).unwrap();
        feed_failures(&bulkhead, 4);

        assert_eq!(bulkhead.state(), AdaptiveState::CongestionAvoidance);
        assert_eq!(bulkhead.metrics().max_allowed_concurrent_calls, 8);
    }

    #[test]
    fn test_congestion_avoidance_grows_additively() {
        let bulkhead = AdaptiveBulkhead::of("adaptive", config(2, 64, 16, 4)).unwrap();
        bulkhead.transition_to_congestion_avoidance();

        feed_successes(&bulkhead, 4);
        assert_eq!(bulkhead.metrics().max_allowed_concurrent_calls, 17);

        feed_successes(&bulkhead, 4);
        assert_eq!(bulkhead.metrics().max_allowed_concurrent_calls, 18);
    }

    #[test]
    fn test_congestion_avoidance_decreases_multiplicatively() {
        let bulkhead = AdaptiveBulkhead::of("adaptive", config(2, 64, 16, 4)).unwrap();
        bulkhead.transition_to_congestion_avoidance();

        feed_failures(&bulkhead, 4);
        assert_eq!(bulkhead.metrics().max_allowed_concurrent_calls, 8);

        feed_failures(&bulkhead, 4);
        assert_eq!(bulkhead.metrics().max_allowed_concurrent_calls, 4);
    }

    #[test]
    fn test_bottoming_out_reenters_slow_start() {
        let bulkhead = AdaptiveBulkhead::of("adaptive", config(2, 64, 2, 4)).unwrap();
        bulkhead.transition_to_congestion_avoidance();

        // Healthy calls at the floor limit signal recovery.
        feed_successes(&bulkhead, 4);
        assert_eq!(bulkhead.state(), AdaptiveState::SlowStart);
        assert_eq!(bulkhead.metrics().max_allowed_concurrent_calls, 2);
    }

    #[test]
    fn test_decrease_is_floored_at_min() {
        let bulkhead = AdaptiveBulkhead::of("adaptive", config(3, 64, 4, 4)).unwrap();
        feed_failures(&bulkhead, 4);
        assert_eq!(bulkhead.metrics().max_allowed_concurrent_calls, 3);
    }

    #[test]
    fn test_window_resets_on_limit_change_and_regime_switch() {
        let bulkhead = AdaptiveBulkhead::of("adaptive", config(2, 64, 2, 4)).unwrap();
        feed_successes(&bulkhead, 4);
        // The limit change that followed must have cleared the window.
        assert_eq!(bulkhead.metrics().calls.total_calls, 0);

        feed_failures(&bulkhead, 3);
        assert_eq!(bulkhead.metrics().calls.total_calls, 3);
        bulkhead.transition_to_congestion_avoidance();
        assert_eq!(bulkhead.metrics().calls.total_calls, 0);
    }

    #[test]
    fn test_ignored_errors_do_not_adapt() {
        let config = AdaptiveBulkheadConfig::builder()
            .min_concurrent_calls(2)
            .max_concurrent_calls(64)
            .initial_concurrent_calls(8)
            .minimum_number_of_calls(2)
            .sliding_window_count_based(2)
            .ignore_error(|e| e.to_string().contains("overloaded"))
            .build()
            .unwrap();
        let bulkhead = AdaptiveBulkhead::of("adaptive", config).unwrap();

        feed_failures(&bulkhead, 10);
        assert_eq!(bulkhead.metrics().max_allowed_concurrent_calls, 8);
        assert_eq!(bulkhead.metrics().calls.total_calls, 0);
        assert_eq!(bulkhead.state(), AdaptiveState::SlowStart);
    }

    #[test]
    fn test_limit_changes_emit_events() {
        let bulkhead = AdaptiveBulkhead::of("adaptive", config(2, 64, 8, 4)).unwrap();
        let seen = Mutex::new(Vec::new());
        let seen = Arc::new(seen);
        let sink = Arc::clone(&seen);
        bulkhead
            .event_publisher()
            .on_event(move |event: &AdaptiveBulkheadEvent| sink.lock().push(event.kind));

        feed_successes(&bulkhead, 4);
        feed_failures(&bulkhead, 4);

        let kinds = seen.lock();
        assert!(kinds.contains(&AdaptiveBulkheadEventKind::LimitIncreased { new_limit: 16 }));
        assert!(kinds.contains(&AdaptiveBulkheadEventKind::LimitDecreased { new_limit: 8 }));
        assert!(kinds.contains(&AdaptiveBulkheadEventKind::StateTransition {
            from: AdaptiveState::SlowStart,
            to: AdaptiveState::CongestionAvoidance,
        }));
    }

    #[tokio::test]
    async fn test_execute_caps_concurrency_at_the_current_limit() {
        let bulkhead = AdaptiveBulkhead::of("adaptive", config(1, 4, 1, 100)).unwrap();

        let held = bulkhead.try_acquire_permission().unwrap();
        assert!(bulkhead.try_acquire_permission().is_none());

        let rejected = bulkhead
            .execute(|| async { Ok::<_, io::Error>(()) })
            .await
            .unwrap_err();
        assert!(rejected.is_rejected());

        drop(held);
        assert!(bulkhead
            .execute(|| async { Ok::<_, io::Error>(()) })
            .await
            .is_ok());
    }
}
