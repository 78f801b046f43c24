//! Continuous-refill permit scheduler
//!
//! Permits replenish one every `nanos_per_permission` up to
//! `permit_capacity`, instead of arriving in per-cycle batches. The state
//! is `(permits, last_refill_nanos)`; the refill keeps the sub-permit
//! remainder by advancing `last_refill_nanos` only by whole permits.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::clock::{Clock, SystemClock};
use crate::core::error::ConfigResult;
use crate::core::event::EventPublisher;

use super::{
    RateLimiter, RateLimiterEvent, RateLimiterEventKind, RateLimiterMetrics,
    RefillRateLimiterConfig,
};

#[derive(Debug, Clone, Copy)]
struct RefillState {
    /// May go negative while reservations are outstanding
    permits: i64,
    /// Nanos timestamp the balance was last brought forward to
    last_refill_nanos: u64,
}

/// Rate limiter with linear permit replenishment.
pub struct RefillRateLimiter {
    name: String,
    config: RefillRateLimiterConfig,
    nanos_per_permission: u64,
    clock: Arc<dyn Clock>,
    started_at: Instant,
    state: Mutex<RefillState>,
    waiting: AtomicUsize,
    publisher: EventPublisher<RateLimiterEvent>,
}

impl RefillRateLimiter {
    /// Create a limiter with the given configuration.
    pub fn of(name: impl Into<String>, config: RefillRateLimiterConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Create a limiter with default configuration.
    #[must_use]
    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::of(name, RefillRateLimiterConfig::default())
            .expect("default refill rate limiter config is valid")
    }

    /// Create a limiter deciding time through the given clock.
    pub fn with_clock(
        name: impl Into<String>,
        config: RefillRateLimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let started_at = clock.now();
        Ok(Self {
            name: name.into(),
            nanos_per_permission: config.nanos_per_permission(),
            state: Mutex::new(RefillState {
                permits: i64::from(config.initial_permits),
                last_refill_nanos: 0,
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
    pub fn config(&self) -> &RefillRateLimiterConfig {
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

    fn timeout_nanos(&self) -> u64 {
        u64::try_from(self.config.timeout_duration.as_nanos()).unwrap_or(u64::MAX)
    }

    fn update_state(&self, permits: u32, timeout_nanos: u64) -> NextRefillState {
        let now_nanos = self.current_nanos();
        let mut state = self.state.lock();
        let next = next_state(
            &self.config,
            self.nanos_per_permission,
            *state,
            permits,
            timeout_nanos,
            now_nanos,
        );
        *state = RefillState {
            permits: next.permits,
            last_refill_nanos: next.last_refill_nanos,
        };
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
impl RateLimiter for RefillRateLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire_permission(&self, permits: u32) -> bool {
        let timeout_nanos = self.timeout_nanos();
        let next = self.update_state(permits, timeout_nanos);
        let granted = self
            .wait_for_permission(timeout_nanos, next.nanos_to_wait)
            .await;
        self.publish(granted, permits);
        granted
    }

    fn try_acquire_permission(&self, permits: u32) -> bool {
        let next = self.update_state(permits, 0);
        let granted = next.nanos_to_wait == 0;
        self.publish(granted, permits);
        granted
    }

    fn reserve_permission(&self, permits: u32) -> Option<Duration> {
        let timeout_nanos = self.timeout_nanos();
        let next = self.update_state(permits, timeout_nanos);
        let reserved = timeout_nanos >= next.nanos_to_wait;
        self.publish(reserved, permits);
        reserved.then(|| Duration::from_nanos(next.nanos_to_wait))
    }

    fn metrics(&self) -> RateLimiterMetrics {
        let now_nanos = self.current_nanos();
        let state = self.state.lock();
        let projected = next_state(
            &self.config,
            self.nanos_per_permission,
            *state,
            0,
            0,
            now_nanos,
        );
        RateLimiterMetrics {
            available_permissions: projected.permits,
            number_of_waiting_callers: self.waiting.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RefillRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefillRateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
struct NextRefillState {
    permits: i64,
    last_refill_nanos: u64,
    nanos_to_wait: u64,
}

/// Side-effect-free reservation step: replenish whole permits for the
/// elapsed time, price the request, and consume only when the wait fits
/// the caller's timeout.
fn next_state(
    config: &RefillRateLimiterConfig,
    nanos_per_permission: u64,
    state: RefillState,
    permits: u32,
    timeout_nanos: u64,
    now_nanos: u64,
) -> NextRefillState {
    let capacity = i64::from(config.permit_capacity);

    let elapsed = now_nanos.saturating_sub(state.last_refill_nanos);
    let accumulated = i64::try_from(elapsed / nanos_per_permission).unwrap_or(i64::MAX);
    let mut permits_now = state.permits.saturating_add(accumulated).min(capacity);
    // Keep the sub-permit remainder unless the balance hit capacity, in
    // which case the surplus time is forfeited.
    let last_refill_nanos = if permits_now == capacity {
        now_nanos
    } else {
        state
            .last_refill_nanos
            .saturating_add((elapsed / nanos_per_permission) * nanos_per_permission)
    };

    let requested = i64::from(permits);
    let nanos_to_wait = if permits_now >= requested {
        0
    } else {
        let missing = u64::try_from(requested - permits_now).unwrap_or(u64::MAX);
        let since_last_whole_permit = now_nanos.saturating_sub(last_refill_nanos);
        missing
            .saturating_mul(nanos_per_permission)
            .saturating_sub(since_last_whole_permit)
    };

    if timeout_nanos >= nanos_to_wait {
        permits_now -= requested;
    }

    NextRefillState {
        permits: permits_now,
        last_refill_nanos,
        nanos_to_wait,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::MockClock;

    fn limiter(
        limit: u32,
        period: Duration,
        timeout: Duration,
        initial: u32,
    ) -> (RefillRateLimiter, MockClock) {
        let clock = MockClock::new();
        let config = RefillRateLimiterConfig::builder()
            .limit_for_period(limit)
            .limit_refresh_period(period)
            .timeout_duration(timeout)
            .initial_permits(initial)
            .build()
            .unwrap();
        let limiter =
            RefillRateLimiter::with_clock("refill", config, Arc::new(clock.clone())).unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_initial_permits_are_spendable() {
        let (limiter, _clock) = limiter(10, Duration::from_secs(1), Duration::ZERO, 3);
        assert!(limiter.try_acquire_permission(3));
        assert!(!limiter.try_acquire_permission(1));
    }

    #[test]
    fn test_permits_replenish_linearly() {
        // One permit every 100ms.
        let (limiter, clock) = limiter(10, Duration::from_secs(1), Duration::ZERO, 0);
        assert!(!limiter.try_acquire_permission(1));

        clock.advance(Duration::from_millis(250));
        assert_eq!(limiter.metrics().available_permissions, 2);
        assert!(limiter.try_acquire_permission(2));
        assert!(!limiter.try_acquire_permission(1));

        // The 50ms remainder counts toward the next permit.
        clock.advance(Duration::from_millis(50));
        assert!(limiter.try_acquire_permission(1));
    }

    #[test]
    fn test_balance_is_capped_at_capacity() {
        let (limiter, clock) = limiter(10, Duration::from_secs(1), Duration::ZERO, 10);
        clock.advance(Duration::from_secs(100));
        assert_eq!(limiter.metrics().available_permissions, 10);
    }

    #[test]
    fn test_reserve_reports_linear_wait() {
        let (limiter, _clock) = limiter(10, Duration::from_secs(1), Duration::from_secs(5), 0);
        // Three permits at 100ms each.
        let wait = limiter.reserve_permission(3).unwrap();
        assert_eq!(wait, Duration::from_millis(300));
        assert_eq!(limiter.metrics().available_permissions, -3);
    }

    #[test]
    fn test_reserve_beyond_timeout_consumes_nothing() {
        let (limiter, _clock) = limiter(10, Duration::from_secs(1), Duration::from_millis(100), 0);
        assert!(limiter.reserve_permission(5).is_none());
        assert_eq!(limiter.metrics().available_permissions, 0);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let clock = MockClock::new();
        let config = RefillRateLimiterConfig::builder()
            .limit_for_period(100)
            .limit_refresh_period(Duration::from_secs(1))
            .timeout_duration(Duration::from_secs(1))
            .initial_permits(0)
            .build()
            .unwrap();
        let limiter =
            RefillRateLimiter::with_clock("refill", config, Arc::new(clock.clone())).unwrap();

        // 10ms per permit: the wait is served on the timer, the
        // reservation is already booked.
        let started = std::time::Instant::now();
        assert!(limiter.acquire_permission(1).await);
        assert!(started.elapsed() >= Duration::from_millis(8));
    }
}
