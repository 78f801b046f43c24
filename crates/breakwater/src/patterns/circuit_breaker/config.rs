//! Circuit breaker configuration

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::core::error::{ConfigError, ConfigResult};

/// Predicate over user errors, built once at configuration time.
///
/// The breaker only ever calls the closure; how errors are matched
/// (by kind, by message, by downcast) is the caller's choice.
pub type ErrorPredicate = Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync>;

fn record_all() -> ErrorPredicate {
    Arc::new(|_| true)
}

fn ignore_none() -> ErrorPredicate {
    Arc::new(|_| false)
}

/// Which sliding window buffers recorded outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlidingWindowType {
    /// Aggregate the outcome of the last N calls
    CountBased,
    /// Aggregate the outcomes of the last N seconds
    TimeBased,
}

/// Circuit breaker configuration. Immutable once built.
#[derive(Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failure percentage in `(0, 100]` at which the breaker opens
    pub failure_rate_threshold: f32,
    /// Slow-call percentage in `(0, 100]` at which the breaker opens
    pub slow_call_rate_threshold: f32,
    /// Calls at or over this duration classify as slow
    #[serde(with = "humantime_serde")]
    pub slow_call_duration_threshold: Duration,
    /// Samples required before the rate thresholds evaluate
    pub minimum_number_of_calls: u64,
    /// Count-based or time-based outcome aggregation
    pub sliding_window_type: SlidingWindowType,
    /// N slots (count-based) or N seconds (time-based)
    pub sliding_window_size: usize,
    /// How long the breaker stays open before probing
    #[serde(with = "humantime_serde")]
    pub wait_duration_in_open_state: Duration,
    /// Trial permits granted while half-open
    pub permitted_number_of_calls_in_half_open_state: u32,
    /// Leave the open state on a timer instead of on the next call
    pub automatic_transition_from_open_to_half_open: bool,
    /// Which user errors count as failures
    #[serde(skip, default = "record_all")]
    pub record_error: ErrorPredicate,
    /// Which user errors neither fail nor succeed
    #[serde(skip, default = "ignore_none")]
    pub ignore_error: ErrorPredicate,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            minimum_number_of_calls: 100,
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            wait_duration_in_open_state: Duration::from_secs(60),
            permitted_number_of_calls_in_half_open_state: 10,
            automatic_transition_from_open_to_half_open: false,
            record_error: record_all(),
            ignore_error: ignore_none(),
        }
    }
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_rate_threshold", &self.failure_rate_threshold)
            .field("slow_call_rate_threshold", &self.slow_call_rate_threshold)
            .field(
                "slow_call_duration_threshold",
                &self.slow_call_duration_threshold,
            )
            .field("minimum_number_of_calls", &self.minimum_number_of_calls)
            .field("sliding_window_type", &self.sliding_window_type)
            .field("sliding_window_size", &self.sliding_window_size)
            .field(
                "wait_duration_in_open_state",
                &self.wait_duration_in_open_state,
            )
            .field(
                "permitted_number_of_calls_in_half_open_state",
                &self.permitted_number_of_calls_in_half_open_state,
            )
            .field(
                "automatic_transition_from_open_to_half_open",
                &self.automatic_transition_from_open_to_half_open,
            )
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::default()
    }

    /// Validate field ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0) {
            return Err(ConfigError::validation(
                "failure_rate_threshold must be in (0, 100]",
            ));
        }
        if !(self.slow_call_rate_threshold > 0.0 && self.slow_call_rate_threshold <= 100.0) {
            return Err(ConfigError::validation(
                "slow_call_rate_threshold must be in (0, 100]",
            ));
        }
        if self.minimum_number_of_calls == 0 {
            return Err(ConfigError::validation(
                "minimum_number_of_calls must be at least 1",
            ));
        }
        if self.sliding_window_size == 0 {
            return Err(ConfigError::validation(
                "sliding_window_size must be at least 1",
            ));
        }
        if self.permitted_number_of_calls_in_half_open_state == 0 {
            return Err(ConfigError::validation(
                "permitted_number_of_calls_in_half_open_state must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Failure percentage at which the breaker opens.
    #[must_use]
    pub fn failure_rate_threshold(mut self, threshold: f32) -> Self {
        self.config.failure_rate_threshold = threshold;
        self
    }

    /// Slow-call percentage at which the breaker opens.
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

    /// Samples required before the rate thresholds evaluate.
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

    /// How long the breaker stays open before probing.
    #[must_use]
    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config.wait_duration_in_open_state = wait;
        self
    }

    /// Trial permits granted while half-open.
    #[must_use]
    pub fn permitted_number_of_calls_in_half_open_state(mut self, calls: u32) -> Self {
        self.config.permitted_number_of_calls_in_half_open_state = calls;
        self
    }

    /// Leave the open state on a timer instead of on the next call.
    #[must_use]
    pub fn automatic_transition_from_open_to_half_open(mut self, enabled: bool) -> Self {
        self.config.automatic_transition_from_open_to_half_open = enabled;
        self
    }

    /// Errors matching the predicate are recorded as failures; everything
    /// else records as success.
    #[must_use]
    pub fn record_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.record_error = Arc::new(predicate);
        self
    }

    /// Errors matching the predicate are ignored: the permission is
    /// released and no outcome is recorded.
    #[must_use]
    pub fn ignore_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.ignore_error = Arc::new(predicate);
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl crate::core::config::ResilienceConfig for CircuitBreakerConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_out_of_range_thresholds() {
        assert!(CircuitBreakerConfig::builder()
            .failure_rate_threshold(0.0)
            .build()
            .is_err());
        assert!(CircuitBreakerConfig::builder()
            .failure_rate_threshold(100.5)
            .build()
            .is_err());
        assert!(CircuitBreakerConfig::builder()
            .slow_call_rate_threshold(-1.0)
            .build()
            .is_err());
        assert!(CircuitBreakerConfig::builder()
            .minimum_number_of_calls(0)
            .build()
            .is_err());
        assert!(CircuitBreakerConfig::builder()
            .sliding_window_count_based(0)
            .build()
            .is_err());
        assert!(CircuitBreakerConfig::builder()
            .permitted_number_of_calls_in_half_open_state(0)
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_sets_window_variant() {
        let config = CircuitBreakerConfig::builder()
            .sliding_window_time_based(30)
            .build()
            .unwrap();
        assert_eq!(config.sliding_window_type, SlidingWindowType::TimeBased);
        assert_eq!(config.sliding_window_size, 30);
    }

    #[test]
    fn test_default_predicates_record_everything() {
        let config = CircuitBreakerConfig::default();
        let error = std::io::Error::other("boom");
        assert!((config.record_error)(&error));
        assert!(!(config.ignore_error)(&error));
    }
}
