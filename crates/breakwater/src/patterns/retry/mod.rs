//! Retry: re-invoke a failed computation on a backoff schedule
//!
//! A [`Retry`] wraps an operation in an attempt loop of up to
//! `max_attempts` invocations. Errors route through two predicates:
//! ignored errors propagate immediately without counting as retryable,
//! non-retryable errors propagate immediately, and everything else
//! consumes an attempt and sleeps out the configured interval. A result
//! predicate variant treats matching successes as retryable failures.
//!
//! User errors always surface unchanged; only result-predicate exhaustion
//! produces [`ResilienceError::MaxRetriesExceeded`], because there is no
//! user error to surface in that mode.

mod interval;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::error::{ConfigResult, ExecuteError, ResilienceError};
use crate::core::event::EventPublisher;
use crate::patterns::circuit_breaker::ErrorPredicate;

pub use interval::IntervalStrategy;

use serde::{Deserialize, Serialize};

use crate::core::error::ConfigError;

fn retry_all() -> ErrorPredicate {
    Arc::new(|_| true)
}

fn ignore_none() -> ErrorPredicate {
    Arc::new(|_| false)
}

/// Retry configuration. Immutable once built.
#[derive(Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Invocation budget, including the first call
    pub max_attempts: u32,
    /// Wait schedule between attempts
    pub interval: IntervalStrategy,
    /// Which user errors consume an attempt
    #[serde(skip, default = "retry_all")]
    pub retry_on_error: ErrorPredicate,
    /// Which user errors propagate immediately, bypassing the loop
    #[serde(skip, default = "ignore_none")]
    pub ignore_errors: ErrorPredicate,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval: IntervalStrategy::default(),
            retry_on_error: retry_all(),
            ignore_errors: ignore_none(),
        }
    }
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl RetryConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Validate field ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::validation("max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for [`RetryConfig`].
#[derive(Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    /// Invocation budget, including the first call.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Fixed wait between attempts.
    #[must_use]
    pub fn wait_duration(mut self, wait: Duration) -> Self {
        self.config.interval = IntervalStrategy::fixed(wait);
        self
    }

    /// Custom wait schedule.
    #[must_use]
    pub fn interval_strategy(mut self, interval: IntervalStrategy) -> Self {
        self.config.interval = interval;
        self
    }

    /// Errors matching the predicate consume an attempt; the rest
    /// propagate immediately.
    #[must_use]
    pub fn retry_on_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.retry_on_error = Arc::new(predicate);
        self
    }

    /// Errors matching the predicate propagate immediately and bypass the
    /// retry predicate entirely.
    #[must_use]
    pub fn ignore_errors<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.ignore_errors = Arc::new(predicate);
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// One lifecycle event of one retry instance.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    /// Retry instance name
    pub name: String,
    /// Wall-clock publication time
    pub timestamp: SystemTime,
    /// What happened
    pub kind: RetryEventKind,
}

/// Event discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEventKind {
    /// An attempt failed retryably; the loop sleeps and re-invokes
    Retry {
        /// Attempt that just failed (1-based)
        attempt: u32,
        /// Wait before the next attempt
        wait: Duration,
    },
    /// The decorated call settled successfully
    Success {
        /// Attempts consumed
        attempts: u32,
    },
    /// The decorated call settled with a failure
    Error {
        /// Attempts consumed
        attempts: u32,
    },
    /// An ignored error propagated without consuming the budget
    IgnoredError,
}

/// Counters over all calls decorated by one retry instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryMetrics {
    /// Calls that succeeded on the first attempt
    pub successful_calls_without_retry: u64,
    /// Calls that succeeded after at least one re-attempt
    pub successful_calls_with_retry: u64,
    /// Calls that failed without any re-attempt
    pub failed_calls_without_retry: u64,
    /// Calls that failed after exhausting re-attempts
    pub failed_calls_with_retry: u64,
}

impl RetryMetrics {
    /// All decorated calls observed.
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.successful_calls_without_retry
            + self.successful_calls_with_retry
            + self.failed_calls_without_retry
            + self.failed_calls_with_retry
    }
}

#[derive(Default)]
struct Counters {
    successful_without_retry: AtomicU64,
    successful_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

struct RetryInner {
    name: String,
    config: RetryConfig,
    counters: Counters,
    publisher: EventPublisher<RetryEvent>,
}

/// A named retry instance. Cheap to clone; clones share metrics.
#[derive(Clone)]
pub struct Retry {
    inner: Arc<RetryInner>,
}

impl Retry {
    /// Create a retry with the given configuration.
    pub fn of(name: impl Into<String>, config: RetryConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RetryInner {
                name: name.into(),
                config,
                counters: Counters::default(),
                publisher: EventPublisher::new(),
            }),
        })
    }

    /// Create a retry with default configuration.
    #[must_use]
    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::of(name, RetryConfig::default()).expect("default retry config is valid")
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configuration the retry was built with.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.inner.config
    }

    /// Lifecycle event stream of this instance.
    #[must_use]
    pub fn event_publisher(&self) -> &EventPublisher<RetryEvent> {
        &self.inner.publisher
    }

    /// Counters over all decorated calls.
    #[must_use]
    pub fn metrics(&self) -> RetryMetrics {
        let counters = &self.inner.counters;
        RetryMetrics {
            successful_calls_without_retry: counters.successful_without_retry.load(Ordering::Relaxed),
            successful_calls_with_retry: counters.successful_with_retry.load(Ordering::Relaxed),
            failed_calls_without_retry: counters.failed_without_retry.load(Ordering::Relaxed),
            failed_calls_with_retry: counters.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    /// Run `operation` under the attempt loop. The last user error
    /// propagates unchanged when the budget runs out.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    self.record_success(attempt);
                    return Ok(value);
                }
                Err(error) => match self.route_error(&error, attempt) {
                    ErrorRoute::Propagate => return Err(error),
                    ErrorRoute::RetryAfter(wait) => {
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                    }
                },
            }
        }
    }

    /// Attempt loop that also treats successes matching
    /// `retry_on_result` as retryable failures. Exhausting the budget on
    /// a retryable result surfaces
    /// [`ResilienceError::MaxRetriesExceeded`].
    pub async fn execute_with_result_check<T, E, P, F, Fut>(
        &self,
        retry_on_result: P,
        mut operation: F,
    ) -> Result<T, ExecuteError<E>>
    where
        P: Fn(&T) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if !retry_on_result(&value) {
                        self.record_success(attempt);
                        return Ok(value);
                    }
                    if attempt >= self.inner.config.max_attempts {
                        self.record_failure(attempt);
                        return Err(ExecuteError::Rejected(
                            ResilienceError::MaxRetriesExceeded {
                                name: self.inner.name.clone(),
                                attempts: attempt,
                            },
                        ));
                    }
                    let wait = self.inner.config.interval.interval_for(attempt);
                    debug!(name = %self.inner.name, attempt, ?wait, "result is retryable");
                    self.publish(RetryEventKind::Retry { attempt, wait });
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(error) => match self.route_error(&error, attempt) {
                    ErrorRoute::Propagate => return Err(ExecuteError::Inner(error)),
                    ErrorRoute::RetryAfter(wait) => {
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                    }
                },
            }
        }
    }

    /// Like [`execute`](Self::execute), refusing further attempts and
    /// cancelling pending delays when `token` fires.
    pub async fn execute_cancellable<T, E, F, Fut>(
        &self,
        token: &CancellationToken,
        mut operation: F,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let mut attempt = 1;
        loop {
            if token.is_cancelled() {
                return Err(ExecuteError::Rejected(ResilienceError::Cancelled));
            }
            match operation().await {
                Ok(value) => {
                    self.record_success(attempt);
                    return Ok(value);
                }
                Err(error) => match self.route_error(&error, attempt) {
                    ErrorRoute::Propagate => return Err(ExecuteError::Inner(error)),
                    ErrorRoute::RetryAfter(wait) => {
                        tokio::select! {
                            () = token.cancelled() => {
                                return Err(ExecuteError::Rejected(ResilienceError::Cancelled));
                            }
                            () = tokio::time::sleep(wait) => {}
                        }
                        attempt += 1;
                    }
                },
            }
        }
    }

    /// Blocking-closure variant of [`execute`](Self::execute); sleeps on
    /// the current thread, for use outside async contexts.
    pub fn execute_sync<T, E, F>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: std::error::Error + 'static,
    {
        let mut attempt = 1;
        loop {
            match operation() {
                Ok(value) => {
                    self.record_success(attempt);
                    return Ok(value);
                }
                Err(error) => match self.route_error(&error, attempt) {
                    ErrorRoute::Propagate => return Err(error),
                    ErrorRoute::RetryAfter(wait) => {
                        std::thread::sleep(wait);
                        attempt += 1;
                    }
                },
            }
        }
    }

    /// Wrap `operation` so every invocation runs under the attempt loop.
    pub fn decorate<T, E, F, Fut>(
        &self,
        operation: F,
    ) -> impl Fn() -> Pin<Box<dyn Future<Output = Result<T, E>> + Send>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        let retry = self.clone();
        let operation = Arc::new(operation);
        move || {
            let retry = retry.clone();
            let operation = Arc::clone(&operation);
            Box::pin(async move { retry.execute(|| (*operation)()).await })
        }
    }

    fn route_error(
        &self,
        error: &(dyn std::error::Error + 'static),
        attempt: u32,
    ) -> ErrorRoute {
        let config = &self.inner.config;
        if (config.ignore_errors)(error) {
            self.publish(RetryEventKind::IgnoredError);
            return ErrorRoute::Propagate;
        }
        if !(config.retry_on_error)(error) || attempt >= config.max_attempts {
            self.record_failure(attempt);
            return ErrorRoute::Propagate;
        }
        let wait = config.interval.interval_for(attempt);
        debug!(name = %self.inner.name, attempt, ?wait, error = %error, "attempt failed, retrying");
        self.publish(RetryEventKind::Retry { attempt, wait });
        ErrorRoute::RetryAfter(wait)
    }

    fn record_success(&self, attempts: u32) {
        let counter = if attempts == 1 {
            &self.inner.counters.successful_without_retry
        } else {
            &self.inner.counters.successful_with_retry
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.publish(RetryEventKind::Success { attempts });
    }

    fn record_failure(&self, attempts: u32) {
        let counter = if attempts == 1 {
            &self.inner.counters.failed_without_retry
        } else {
            &self.inner.counters.failed_with_retry
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.publish(RetryEventKind::Error { attempts });
    }

    fn publish(&self, kind: RetryEventKind) {
        if self.inner.publisher.has_subscribers() {
            self.inner.publisher.publish(&RetryEvent {
                name: self.inner.name.clone(),
                timestamp: SystemTime::now(),
                kind,
            });
        }
    }
}

enum ErrorRoute {
    Propagate,
    RetryAfter(Duration),
}

impl crate::core::config::ResilienceConfig for RetryConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.validate()
    }
}

impl std::fmt::Debug for Retry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry")
            .field("name", &self.name())
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}
