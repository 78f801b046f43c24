//! Circuit breaker lifecycle events

use std::time::{Duration, SystemTime};

use super::State;

/// One lifecycle event of one breaker instance.
#[derive(Debug, Clone)]
pub struct CircuitBreakerEvent {
    /// Breaker instance name
    pub name: String,
    /// Wall-clock publication time
    pub timestamp: SystemTime,
    /// What happened
    pub kind: CircuitBreakerEventKind,
}

impl CircuitBreakerEvent {
    pub(crate) fn now(name: &str, kind: CircuitBreakerEventKind) -> Self {
        Self {
            name: name.to_owned(),
            timestamp: SystemTime::now(),
            kind,
        }
    }
}

/// Event discriminant with type-specific payloads.
#[derive(Debug, Clone)]
pub enum CircuitBreakerEventKind {
    /// A call was recorded as a success
    Success {
        /// Call duration
        duration: Duration,
    },
    /// A call was recorded as a failure
    Error {
        /// Call duration
        duration: Duration,
        /// Rendered user error
        error: String,
    },
    /// A call raised an error the configuration ignores
    IgnoredError {
        /// Rendered user error
        error: String,
    },
    /// The slow-call rate reached its threshold
    SlowCallRateExceeded {
        /// Slow-call rate at the crossing
        slow_call_rate: f32,
    },
    /// The failure rate reached its threshold
    FailureRateExceeded {
        /// Failure rate at the crossing
        failure_rate: f32,
    },
    /// A call was refused
    CallNotPermitted,
    /// The breaker moved between states
    StateTransition {
        /// State before the move
        from: State,
        /// State after the move
        to: State,
    },
    /// Metrics were cleared and the breaker returned to closed
    Reset,
}

impl CircuitBreakerEventKind {
    /// Stable tag identifying the event type.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Error { .. } => "error",
            Self::IgnoredError { .. } => "ignored-error",
            Self::SlowCallRateExceeded { .. } => "slow-call-rate-exceeded",
            Self::FailureRateExceeded { .. } => "failure-rate-exceeded",
            Self::CallNotPermitted => "call-not-permitted",
            Self::StateTransition { .. } => "state-transition",
            Self::Reset => "reset",
        }
    }
}
