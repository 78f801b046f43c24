//! Cycle-based permit scheduler
//!
//! Time since construction is divided into cycles of
//! `limit_refresh_period`. The whole limiter state is one small value
//! `(active_cycle, active_permissions, nanos_to_wait)` advanced by a pure
//! next-state function and swapped in under a short lock, so concurrent
//! callers each reserve against a consistent view. `active_permissions`
//! goes negative while reservations for future cycles are outstanding.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::core::clock::{Clock, SystemClock};
use crate::core::error::ConfigResult;
use crate::core::event::EventPublisher;

use super::{
    RateLimiter, RateLimiterConfig, RateLimiterEvent, RateLimiterEventKind, RateLimiterMetrics,
};

#[derive(Debug, Clone, Copy)]
struct LimiterState {
    active_cycle: u64,
    active_permissions: i64,
    nanos_to_wait: u64,
}

/// The atomic token/period rate limiter.
pub struct CycleRateLimiter {
    name: String,
    config: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    started_at: Instant,
    state: Mutex<LimiterState>,
    waiting: AtomicUsize,
    publisher: EventPublisher<RateLimiterEvent>,
}

impl CycleRateLimiter {
    /// Create a limiter with the given configuration.
    pub fn of(name: impl Into<String>, config: RateLimiterConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Create a limiter with default configuration.
    #[must_use]
    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::of(name, RateLimiterConfig::default()).expect("default rate limiter config is valid")
    }

    /// Create a limiter deciding time through the given clock.
    pub fn with_clock(
        name: impl Into<String>,
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let started_at = clock.now();
        Ok(Self {
            name: name.into(),
            state: Mutex::new(LimiterState {
                active_cycle: 0,
                active_permissions: i64::from(config.limit_for_period),
                nanos_to_wait: 0,
            }),
            config,
            clock,
            started_at,
            waiting: AtomicUsize::new(0),
            publisher: EventPublisher::new(),
        })
    }

    /// The configuration the limiter was built with.
    #[must_use]
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Lifecycle event stream of this instance.
    #[must_use]
    pub fn event_publisher(&self) -> &EventPublisher<RateLimiterEvent> {
        &self.publisher
    }

    fn current_nanos(&self) -> u64 {
        u64::try_from(
            self.clock
                .now()
                .duration_since(self.started_at)
                .as_nanos(),
        )
        .unwrap_or(u64::MAX)
    }

    fn cycle_period_nanos(&self) -> u64 {
        u64::try_from(self.config.limit_refresh_period.as_nanos()).unwrap_or(u64::MAX)
    }

    fn timeout_nanos(&self) -> u64 {
        u64::try_from(self.config.timeout_duration.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Advance the state by one reservation attempt and return the result.
    fn update_state(&self, permits: u32, timeout_nanos: u64) -> LimiterState {
        let now_nanos = self.current_nanos();
        let mut state = self.state.lock();
        let next = next_state(&self.config, *state, permits, timeout_nanos, now_nanos);
        *state = next;
        next
    }

    async fn wait_for_permission(&self, timeout_nanos: u64, nanos_to_wait: u64) -> bool {
        if nanos_to_wait == 0 {
            return true;
        }
        let granted = timeout_nanos >= nanos_to_wait;
        let sleep_nanos = if granted { nanos_to_wait } else { timeout_nanos };
        self.waiting.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_nanos(sleep_nanos)).await;
        self.waiting.fetch_sub(1, Ordering::Relaxed);
        granted
    }

    fn publish(&self, granted: bool, permits: u32) {
        if !self.publisher.has_subscribers() {
            return;
        }
        let kind = if granted {
            RateLimiterEventKind::Acquired { permits }
        } else {
            RateLimiterEventKind::Rejected { permits }
        };
        self.publisher
            .publish(&RateLimiterEvent::now(&self.name, kind));
    }

    /// Wrap `operation` so every invocation runs under this limiter.
    pub fn decorate<T, E, F, Fut>(
        self: &Arc<Self>,
        operation: F,
    ) -> impl Fn() -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<T, crate::core::error::ExecuteError<E>>> + Send>,
    >
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let limiter = Arc::clone(self);
        let operation = Arc::new(operation);
        move || {
            let limiter = Arc::clone(&limiter);
            let operation = Arc::clone(&operation);
            Box::pin(async move { limiter.execute(|| (*operation)()).await })
        }
    }
}

#[async_trait]
impl RateLimiter for CycleRateLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire_permission(&self, permits: u32) -> bool {
        let timeout_nanos = self.timeout_nanos();
        let state = self.update_state(permits, timeout_nanos);
        let granted = self
            .wait_for_permission(timeout_nanos, state.nanos_to_wait)
            .await;
        if !granted {
            debug!(name = %self.name, permits, "permission denied within timeout");
        }
        self.publish(granted, permits);
        granted
    }

    fn try_acquire_permission(&self, permits: u32) -> bool {
        let state = self.update_state(permits, 0);
        let granted = state.nanos_to_wait == 0;
        self.publish(granted, permits);
        granted
    }

    fn reserve_permission(&self, permits: u32) -> Option<Duration> {
        let timeout_nanos = self.timeout_nanos();
        let state = self.update_state(permits, timeout_nanos);
        let reserved = timeout_nanos >= state.nanos_to_wait;
        self.publish(reserved, permits);
        reserved.then(|| Duration::from_nanos(state.nanos_to_wait))
    }

    fn metrics(&self) -> RateLimiterMetrics {
        let now_nanos = self.current_nanos();
        let state = self.state.lock();
        // Project the balance into the current cycle without reserving.
        let projected = next_state(&self.config, *state, 0, 0, now_nanos);
        RateLimiterMetrics {
            available_permissions: projected.active_permissions,
            number_of_waiting_callers: self.waiting.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CycleRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleRateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Side-effect-free reservation step: roll the state forward to the
/// current cycle, price the requested permits, and consume them only when
/// the wait fits the caller's timeout.
fn next_state(
    config: &RateLimiterConfig,
    state: LimiterState,
    permits: u32,
    timeout_nanos: u64,
    now_nanos: u64,
) -> LimiterState {
    let cycle_period = u64::try_from(config.limit_refresh_period.as_nanos()).unwrap_or(u64::MAX);
    let limit = i64::from(config.limit_for_period);
    let current_cycle = now_nanos / cycle_period;

    let mut cycle = state.active_cycle;
    let mut permissions = state.active_permissions;
    if current_cycle > cycle {
        let elapsed_cycles = i64::try_from(current_cycle - cycle).unwrap_or(i64::MAX);
        let accumulated = elapsed_cycles.saturating_mul(limit);
        cycle = current_cycle;
        permissions = permissions.saturating_add(accumulated).min(limit);
    }

    let nanos_to_wait = nanos_to_wait_for_permission(
        permits,
        cycle_period,
        limit,
        permissions,
        now_nanos,
        current_cycle,
    );
    let can_acquire_in_time = timeout_nanos >= nanos_to_wait;
    if can_acquire_in_time {
        permissions -= i64::from(permits);
    }

    LimiterState {
        active_cycle: cycle,
        active_permissions: permissions,
        nanos_to_wait,
    }
}

fn nanos_to_wait_for_permission(
    permits: u32,
    cycle_period: u64,
    limit: i64,
    available: i64,
    now_nanos: u64,
    current_cycle: u64,
) -> u64 {
    let permits = i64::from(permits);
    if available >= permits {
        return 0;
    }
    let next_cycle_time = (current_cycle + 1).saturating_mul(cycle_period);
    let nanos_to_next_cycle = next_cycle_time - now_nanos;
    let permissions_at_next_cycle = available + limit;
    let full_cycles_to_wait = div_ceil(-(permissions_at_next_cycle - permits), limit);
    u64::try_from(full_cycles_to_wait)
        .unwrap_or(0)
        .saturating_mul(cycle_period)
        .saturating_add(nanos_to_next_cycle)
}

fn div_ceil(numerator: i64, denominator: i64) -> i64 {
    (numerator + denominator - 1) / denominator
}
