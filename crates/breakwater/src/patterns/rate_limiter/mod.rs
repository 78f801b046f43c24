//! Rate limiting: permit schedulers over time-sliced periods
//!
//! Two implementations share the [`RateLimiter`] contract:
//!
//! - [`CycleRateLimiter`]: time since construction is divided into refresh
//!   cycles; each cycle issues at most `limit_for_period` permits, and
//!   callers may reserve permits from future cycles by waiting.
//! - [`RefillRateLimiter`]: permits replenish continuously at a fixed
//!   nanos-per-permit rate up to a capacity, with a configurable starting
//!   balance.
//!
//! When `acquire` returns `true` the caller holds its permits and may
//! proceed immediately; any required wait already happened inside the
//! call. When it returns `false`, nothing was consumed from future
//! periods.

mod cycle;
mod refill;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, SystemTime};

use crate::core::error::{ConfigError, ConfigResult, ExecuteError, ResilienceError};

pub use cycle::CycleRateLimiter;
pub use refill::RefillRateLimiter;

/// Cycle limiter configuration. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Permits issued per refresh period
    pub limit_for_period: u32,
    /// Length of one refresh period
    #[serde(with = "humantime_serde")]
    pub limit_refresh_period: Duration,
    /// Longest a caller may wait for permits
    #[serde(with = "humantime_serde")]
    pub timeout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 50,
            limit_refresh_period: Duration::from_nanos(500),
            timeout_duration: Duration::from_secs(5),
        }
    }
}

impl RateLimiterConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::default()
    }

    /// Validate field ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.limit_for_period == 0 {
            return Err(ConfigError::validation("limit_for_period must be at least 1"));
        }
        if self.limit_refresh_period < Duration::from_nanos(1) {
            return Err(ConfigError::validation("limit_refresh_period is too short"));
        }
        Ok(())
    }
}

/// Builder for [`RateLimiterConfig`].
#[derive(Default)]
pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl RateLimiterConfigBuilder {
    /// Permits issued per refresh period.
    #[must_use]
    pub fn limit_for_period(mut self, limit: u32) -> Self {
        self.config.limit_for_period = limit;
        self
    }

    /// Length of one refresh period.
    #[must_use]
    pub fn limit_refresh_period(mut self, period: Duration) -> Self {
        self.config.limit_refresh_period = period;
        self
    }

    /// Longest a caller may wait for permits.
    #[must_use]
    pub fn timeout_duration(mut self, timeout: Duration) -> Self {
        self.config.timeout_duration = timeout;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> ConfigResult<RateLimiterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Refill limiter configuration. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefillRateLimiterConfig {
    /// Permits replenished per refresh period
    pub limit_for_period: u32,
    /// Period over which `limit_for_period` permits replenish
    #[serde(with = "humantime_serde")]
    pub limit_refresh_period: Duration,
    /// Longest a caller may wait for permits
    #[serde(with = "humantime_serde")]
    pub timeout_duration: Duration,
    /// Most permits the limiter can hold
    pub permit_capacity: u32,
    /// Permits available at construction
    pub initial_permits: u32,
}

impl Default for RefillRateLimiterConfig {
    fn default() -> Self {
        let base = RateLimiterConfig::default();
        Self {
            permit_capacity: base.limit_for_period,
            initial_permits: base.limit_for_period,
            limit_for_period: base.limit_for_period,
            limit_refresh_period: base.limit_refresh_period,
            timeout_duration: base.timeout_duration,
        }
    }
}

impl RefillRateLimiterConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> RefillRateLimiterConfigBuilder {
        RefillRateLimiterConfigBuilder::default()
    }

    /// Validate field ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.limit_for_period == 0 {
            return Err(ConfigError::validation("limit_for_period must be at least 1"));
        }
        if self.limit_refresh_period < Duration::from_nanos(1) {
            return Err(ConfigError::validation("limit_refresh_period is too short"));
        }
        if self.permit_capacity < self.limit_for_period {
            return Err(ConfigError::validation(
                "permit_capacity must be at least limit_for_period",
            ));
        }
        if self.initial_permits > self.permit_capacity {
            return Err(ConfigError::validation(
                "initial_permits must not exceed permit_capacity",
            ));
        }
        Ok(())
    }

    /// Replenishment interval of a single permit, in nanoseconds.
    #[must_use]
    pub(crate) fn nanos_per_permission(&self) -> u64 {
        let period = u64::try_from(self.limit_refresh_period.as_nanos()).unwrap_or(u64::MAX);
        (period / u64::from(self.limit_for_period)).max(1)
    }
}

/// Builder for [`RefillRateLimiterConfig`].
pub struct RefillRateLimiterConfigBuilder {
    config: RefillRateLimiterConfig,
    capacity_set: bool,
    initial_set: bool,
}

impl Default for RefillRateLimiterConfigBuilder {
    fn default() -> Self {
        Self {
            config: RefillRateLimiterConfig::default(),
            capacity_set: false,
            initial_set: false,
        }
    }
}

impl RefillRateLimiterConfigBuilder {
    /// Permits replenished per refresh period. Unless overridden, capacity
    /// and initial permits follow this value.
    #[must_use]
    pub fn limit_for_period(mut self, limit: u32) -> Self {
        self.config.limit_for_period = limit;
        if !self.capacity_set {
            self.config.permit_capacity = limit;
        }
        if !self.initial_set {
            self.config.initial_permits = limit;
        }
        self
    }

    /// Period over which `limit_for_period` permits replenish.
    #[must_use]
    pub fn limit_refresh_period(mut self, period: Duration) -> Self {
        self.config.limit_refresh_period = period;
        self
    }

    /// Longest a caller may wait for permits.
    #[must_use]
    pub fn timeout_duration(mut self, timeout: Duration) -> Self {
        self.config.timeout_duration = timeout;
        self
    }

    /// Most permits the limiter can hold.
    #[must_use]
    pub fn permit_capacity(mut self, capacity: u32) -> Self {
        self.config.permit_capacity = capacity;
        self.capacity_set = true;
        self
    }

    /// Permits available at construction.
    #[must_use]
    pub fn initial_permits(mut self, permits: u32) -> Self {
        self.config.initial_permits = permits;
        self.initial_set = true;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> ConfigResult<RefillRateLimiterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// One lifecycle event of one limiter instance.
#[derive(Debug, Clone)]
pub struct RateLimiterEvent {
    /// Limiter instance name
    pub name: String,
    /// Wall-clock publication time
    pub timestamp: SystemTime,
    /// What happened
    pub kind: RateLimiterEventKind,
}

impl RateLimiterEvent {
    pub(crate) fn now(name: &str, kind: RateLimiterEventKind) -> Self {
        Self {
            name: name.to_owned(),
            timestamp: SystemTime::now(),
            kind,
        }
    }
}

/// Event discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiterEventKind {
    /// Permits were granted
    Acquired {
        /// How many
        permits: u32,
    },
    /// Permits were denied within the timeout
    Rejected {
        /// How many were requested
        permits: u32,
    },
}

/// Point-in-time metrics of one limiter.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterMetrics {
    /// Permits available right now; negative values are reservations
    /// already handed to waiting callers
    pub available_permissions: i64,
    /// Callers currently sleeping for permits
    pub number_of_waiting_callers: usize,
}

/// Common contract of the permit schedulers.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Instance name.
    fn name(&self) -> &str;

    /// Acquire `permits`, waiting up to the configured timeout. `true`
    /// means the caller holds the permits and may proceed immediately.
    async fn acquire_permission(&self, permits: u32) -> bool;

    /// Acquire `permits` without waiting.
    fn try_acquire_permission(&self, permits: u32) -> bool;

    /// Reserve `permits` and report the wait the caller would have to
    /// serve, or `None` (nothing consumed) if the wait exceeds the
    /// timeout.
    fn reserve_permission(&self, permits: u32) -> Option<Duration>;

    /// Current permit balance and waiter count.
    fn metrics(&self) -> RateLimiterMetrics;

    /// Acquire one permit, waiting up to the configured timeout.
    async fn acquire(&self) -> bool {
        self.acquire_permission(1).await
    }

    /// Run `operation` once one permit is granted; denial maps to
    /// [`ResilienceError::RequestNotPermitted`].
    async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        if self.acquire_permission(1).await {
            operation().await.map_err(ExecuteError::Inner)
        } else {
            Err(ExecuteError::Rejected(
                ResilienceError::request_not_permitted(self.name(), 1),
            ))
        }
    }
}

impl crate::core::config::ResilienceConfig for RateLimiterConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.validate()
    }
}

impl crate::core::config::ResilienceConfig for RefillRateLimiterConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_config_validation() {
        assert!(RateLimiterConfig::default().validate().is_ok());
        assert!(RateLimiterConfig::builder()
            .limit_for_period(0)
            .build()
            .is_err());
        assert!(RateLimiterConfig::builder()
            .limit_refresh_period(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_refill_config_defaults_track_limit() {
        let config = RefillRateLimiterConfig::builder()
            .limit_for_period(10)
            .limit_refresh_period(Duration::from_secs(1))
            .build()
            .unwrap();
        assert_eq!(config.permit_capacity, 10);
        assert_eq!(config.initial_permits, 10);
        assert_eq!(config.nanos_per_permission(), 100_000_000);
    }

    #[test]
    fn test_refill_config_validation() {
        assert!(RefillRateLimiterConfig::builder()
            .limit_for_period(10)
            .permit_capacity(5)
            .build()
            .is_err());
        assert!(RefillRateLimiterConfig::builder()
            .limit_for_period(10)
            .permit_capacity(20)
            .initial_permits(30)
            .build()
            .is_err());
    }
}
