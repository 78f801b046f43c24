//! Error types for fault-tolerance primitives

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the primitives themselves.
///
/// User errors are never wrapped into this type: `execute` combinators
/// surface them through [`ExecuteError::Inner`] untouched, after metrics
/// recording.
#[derive(Debug, Clone, Error)]
#[must_use = "ResilienceError should be returned or handled"]
pub enum ResilienceError {
    /// Circuit breaker refused the call
    #[error("circuit breaker '{name}' is {state} and does not permit further calls")]
    CallNotPermitted {
        /// Breaker instance name
        name: String,
        /// State that denied the permission
        state: String,
    },

    /// Bulkhead permit acquisition timed out or the pool was saturated
    #[error("bulkhead '{name}' is full: {max_concurrent_calls} concurrent calls")]
    BulkheadFull {
        /// Bulkhead instance name
        name: String,
        /// Concurrency cap at the time of rejection
        max_concurrent_calls: usize,
    },

    /// Rate limiter denied the permission within its timeout
    #[error("rate limiter '{name}' does not permit {permits} permit(s)")]
    RequestNotPermitted {
        /// Limiter instance name
        name: String,
        /// Number of permits that were requested
        permits: u32,
    },

    /// Retry exhausted its attempt budget on a retryable result
    #[error("retry '{name}' exhausted all {attempts} attempts")]
    MaxRetriesExceeded {
        /// Retry instance name
        name: String,
        /// Attempts consumed, including the first call
        attempts: u32,
    },

    /// Administrative API requested a forbidden state move
    #[error("'{name}' cannot transition from {from} to {to}")]
    IllegalStateTransition {
        /// Instance name
        name: String,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Operation exceeded a deadline
    #[error("operation timed out after {duration:?}")]
    Timeout {
        /// Deadline that was exceeded
        duration: Duration,
    },

    /// Operation was cancelled before completion
    #[error("operation cancelled")]
    Cancelled,
}

/// Coarse classification used by retry predicates and callers deciding
/// whether a denial is worth waiting out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Momentary condition, safe to retry
    Transient,
    /// A gate refused the call because a resource is exhausted
    ResourceExhaustion,
    /// Misuse of the API, a bug indicator
    Configuration,
    /// Will not succeed on retry
    Permanent,
}

impl ResilienceError {
    /// Create a call-not-permitted error.
    pub fn call_not_permitted(name: impl Into<String>, state: impl Into<String>) -> Self {
        Self::CallNotPermitted {
            name: name.into(),
            state: state.into(),
        }
    }

    /// Create a bulkhead-full error.
    pub fn bulkhead_full(name: impl Into<String>, max_concurrent_calls: usize) -> Self {
        Self::BulkheadFull {
            name: name.into(),
            max_concurrent_calls,
        }
    }

    /// Create a request-not-permitted error.
    pub fn request_not_permitted(name: impl Into<String>, permits: u32) -> Self {
        Self::RequestNotPermitted {
            name: name.into(),
            permits,
        }
    }

    /// Create a timeout error.
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Classify the error for decision making.
    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } => ErrorClass::Transient,
            Self::CallNotPermitted { .. }
            | Self::BulkheadFull { .. }
            | Self::RequestNotPermitted { .. } => ErrorClass::ResourceExhaustion,
            Self::IllegalStateTransition { .. } => ErrorClass::Configuration,
            Self::MaxRetriesExceeded { .. } | Self::Cancelled => ErrorClass::Permanent,
        }
    }

    /// Check if the error is worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classify(),
            ErrorClass::Transient | ErrorClass::ResourceExhaustion
        )
    }

    /// Check if the error is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.classify(),
            ErrorClass::Permanent | ErrorClass::Configuration
        )
    }
}

/// Result alias for operations that can only fail with a primitive error.
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Outcome of a guarded execution.
///
/// Keeps the gate's own refusals apart from the user operation's failures
/// so fallback layers can branch without downcasting, and so user errors
/// cross the library boundary unchanged.
#[derive(Debug, Error)]
pub enum ExecuteError<E> {
    /// The primitive refused to run the operation
    #[error(transparent)]
    Rejected(ResilienceError),
    /// The operation ran and failed with its own error
    #[error(transparent)]
    Inner(E),
}

impl<E> ExecuteError<E> {
    /// The user error, if the operation actually ran and failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected(_) => None,
        }
    }

    /// Whether the call was refused by the primitive before running.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// Invalid builder input.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A field failed validation
    #[error("invalid configuration: {message}")]
    Invalid {
        /// What was wrong
        message: String,
    },
}

impl ConfigError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// Result alias for configuration builders.
pub type ConfigResult<T> = Result<T, ConfigError>;
