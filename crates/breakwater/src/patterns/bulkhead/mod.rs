//! Bulkheads: bounded concurrent-call admission
//!
//! - [`SemaphoreBulkhead`]: a counting semaphore of `max_concurrent_calls`
//!   permits with an optional bounded wait.
//! - [`TaskPoolBulkhead`]: a fixed pool of worker tasks over a bounded
//!   queue; submission returns an asynchronous completion handle, and a
//!   full queue is a full-signal.
//! - [`AdaptiveBulkhead`]: an AIMD control loop retuning a semaphore
//!   bulkhead's limit from observed failure and slow-call rates.

pub mod adaptive;
mod semaphore;
mod task_pool;

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use crate::core::error::{ConfigError, ConfigResult};

pub use adaptive::{
    AdaptiveBulkhead, AdaptiveBulkheadConfig, AdaptiveBulkheadConfigBuilder, AdaptiveBulkheadEvent,
    AdaptiveBulkheadEventKind, AdaptiveBulkheadMetrics, AdaptiveState,
};
pub use semaphore::{BulkheadPermit, SemaphoreBulkhead};
pub use task_pool::{
    CompletionHandle, TaskPoolBulkhead, TaskPoolBulkheadConfig, TaskPoolBulkheadConfigBuilder,
    TaskPoolBulkheadMetrics,
};

/// Semaphore bulkhead configuration. Immutable once built; a running
/// bulkhead accepts a replacement through
/// [`SemaphoreBulkhead::change_config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Calls allowed in flight at once
    pub max_concurrent_calls: usize,
    /// Longest a caller may wait for a permit; zero means fail fast
    #[serde(with = "humantime_serde")]
    pub max_wait_duration: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 25,
            max_wait_duration: Duration::ZERO,
        }
    }
}

impl BulkheadConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder::default()
    }

    /// Validate field ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::validation(
                "max_concurrent_calls must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Builder for [`BulkheadConfig`].
#[derive(Default)]
pub struct BulkheadConfigBuilder {
    config: BulkheadConfig,
}

impl BulkheadConfigBuilder {
    /// Calls allowed in flight at once.
    #[must_use]
    pub fn max_concurrent_calls(mut self, max: usize) -> Self {
        self.config.max_concurrent_calls = max;
        self
    }

    /// Longest a caller may wait for a permit.
    #[must_use]
    pub fn max_wait_duration(mut self, wait: Duration) -> Self {
        self.config.max_wait_duration = wait;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> ConfigResult<BulkheadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl crate::core::config::ResilienceConfig for BulkheadConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.validate()
    }
}

/// One lifecycle event of one bulkhead instance.
#[derive(Debug, Clone)]
pub struct BulkheadEvent {
    /// Bulkhead instance name
    pub name: String,
    /// Wall-clock publication time
    pub timestamp: SystemTime,
    /// What happened
    pub kind: BulkheadEventKind,
}

impl BulkheadEvent {
    pub(crate) fn now(name: &str, kind: BulkheadEventKind) -> Self {
        Self {
            name: name.to_owned(),
            timestamp: SystemTime::now(),
            kind,
        }
    }
}

/// Event discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadEventKind {
    /// A call was admitted
    CallPermitted,
    /// A call was refused
    CallRejected,
    /// An admitted call finished and released its permit
    CallFinished,
}

/// Point-in-time metrics of one semaphore bulkhead.
#[derive(Debug, Clone, Copy)]
pub struct BulkheadMetrics {
    /// Permits currently free
    pub available_concurrent_calls: usize,
    /// Concurrency cap currently in force
    pub max_allowed_concurrent_calls: usize,
}
