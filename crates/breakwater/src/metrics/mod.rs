//! Sliding-window aggregation of recent call outcomes
//!
//! A [`Window`] buffers the outcome of recent calls — count-based over the
//! last N calls, or time-based over the last N seconds — and answers with
//! failure and slow-call rates. Owners (the circuit breaker, the adaptive
//! bulkhead) learn about threshold crossings from the [`ThresholdCheck`]
//! returned by each record, so they never race a separate snapshot read
//! against concurrent writers.
//!
//! Slow classification is derived at record time from the configured
//! duration threshold, never stored by callers. Ignored outcomes are the
//! caller's business and must not reach the window at all.

mod count_window;
mod time_window;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::clock::Clock;

pub(crate) use count_window::CountWindow;
pub(crate) use time_window::TimeWindow;

/// The recorded result of one call, as seen by the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Call completed and counts as a success
    Success,
    /// Call completed and counts as a failure
    Failure,
}

/// Verdict of one recorded outcome against the configured rate thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdCheck {
    /// Fewer than `minimum_number_of_calls` buffered; rates are undefined
    BelowMinimumCalls,
    /// Both failure rate and slow-call rate are under their thresholds
    BelowThresholds,
    /// Failure rate or slow-call rate reached its threshold
    AboveThresholds,
}

/// Running totals maintained add-on-write / subtract-on-evict so reads
/// stay O(1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Aggregate {
    pub total_calls: u64,
    pub failed_calls: u64,
    pub slow_calls: u64,
    pub slow_failed_calls: u64,
    pub total_duration_nanos: u64,
}

impl Aggregate {
    pub(crate) fn add(&mut self, duration_nanos: u64, failed: bool, slow: bool) {
        self.total_calls += 1;
        self.total_duration_nanos += duration_nanos;
        if failed {
            self.failed_calls += 1;
        }
        if slow {
            self.slow_calls += 1;
            if failed {
                self.slow_failed_calls += 1;
            }
        }
    }

    pub(crate) fn subtract(&mut self, other: &Aggregate) {
        self.total_calls -= other.total_calls;
        self.failed_calls -= other.failed_calls;
        self.slow_calls -= other.slow_calls;
        self.slow_failed_calls -= other.slow_failed_calls;
        self.total_duration_nanos -= other.total_duration_nanos;
    }

    pub(crate) fn evict(&mut self, duration_nanos: u64, failed: bool, slow: bool) {
        self.total_calls -= 1;
        self.total_duration_nanos -= duration_nanos;
        if failed {
            self.failed_calls -= 1;
        }
        if slow {
            self.slow_calls -= 1;
            if failed {
                self.slow_failed_calls -= 1;
            }
        }
    }
}

/// Point-in-time view of a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    /// Calls currently buffered in the window
    pub total_calls: u64,
    /// Buffered calls that succeeded
    pub successful_calls: u64,
    /// Buffered calls that failed
    pub failed_calls: u64,
    /// Buffered calls at or over the slow-call duration threshold
    pub slow_calls: u64,
    /// Slow calls that succeeded
    pub slow_successful_calls: u64,
    /// Slow calls that failed
    pub slow_failed_calls: u64,
    /// Cumulative duration of buffered calls
    pub total_duration: Duration,
    /// Failed percentage in `[0, 100]`, or [`Snapshot::NOT_ENOUGH_DATA`]
    pub failure_rate: f32,
    /// Slow percentage in `[0, 100]`, or [`Snapshot::NOT_ENOUGH_DATA`]
    pub slow_call_rate: f32,
}

impl Snapshot {
    /// Sentinel rate reported until `minimum_number_of_calls` outcomes
    /// have been buffered. Only rates `>= 0` participate in threshold
    /// checks.
    pub const NOT_ENOUGH_DATA: f32 = -1.0;

    /// Snapshot of a state that buffers no outcomes.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            slow_calls: 0,
            slow_successful_calls: 0,
            slow_failed_calls: 0,
            total_duration: Duration::ZERO,
            failure_rate: Self::NOT_ENOUGH_DATA,
            slow_call_rate: Self::NOT_ENOUGH_DATA,
        }
    }

    /// Mean duration of buffered calls, zero when empty.
    #[must_use]
    pub fn average_duration(&self) -> Duration {
        if self.total_calls == 0 {
            Duration::ZERO
        } else {
            self.total_duration / u32::try_from(self.total_calls).unwrap_or(u32::MAX)
        }
    }
}

/// Configuration shared by both window variants.
#[derive(Debug, Clone, Copy)]
pub struct WindowSettings {
    /// Samples required before rates are defined
    pub minimum_number_of_calls: u64,
    /// Durations at or over this threshold classify as slow
    pub slow_call_duration_threshold: Duration,
    /// Failure percentage at which [`ThresholdCheck::AboveThresholds`] fires
    pub failure_rate_threshold: f32,
    /// Slow-call percentage at which [`ThresholdCheck::AboveThresholds`] fires
    pub slow_call_rate_threshold: f32,
}

enum WindowKind {
    Count(CountWindow),
    Time(TimeWindow),
}

/// A sliding window of recent call outcomes.
///
/// Thread-safe: recording and snapshotting may race freely; each record is
/// applied exactly once and every snapshot is taken from one consistent
/// aggregate vector.
pub struct Window {
    kind: Mutex<WindowKind>,
    settings: WindowSettings,
    clock: Arc<dyn Clock>,
    started_at: Instant,
}

impl Window {
    /// Window over the outcome of the last `size` calls.
    #[must_use]
    pub fn count_based(size: usize, settings: WindowSettings, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self {
            kind: Mutex::new(WindowKind::Count(CountWindow::new(size))),
            settings,
            clock,
            started_at,
        }
    }

    /// Window over the outcomes recorded in the last `seconds` seconds.
    #[must_use]
    pub fn time_based(seconds: usize, settings: WindowSettings, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self {
            kind: Mutex::new(WindowKind::Time(TimeWindow::new(seconds))),
            settings,
            clock,
            started_at,
        }
    }

    fn epoch_second(&self) -> u64 {
        self.clock.now().duration_since(self.started_at).as_secs()
    }

    /// Record one call outcome and report where the rates now stand.
    pub fn record(&self, duration: Duration, outcome: Outcome) -> ThresholdCheck {
        let duration_nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let failed = outcome == Outcome::Failure;
        let slow = duration >= self.settings.slow_call_duration_threshold;

        let aggregate = match &mut *self.kind.lock() {
            WindowKind::Count(window) => window.record(duration_nanos, failed, slow),
            WindowKind::Time(window) => {
                window.record(self.epoch_second(), duration_nanos, failed, slow)
            }
        };
        self.check(&aggregate)
    }

    /// Current totals and rates.
    pub fn snapshot(&self) -> Snapshot {
        let aggregate = match &mut *self.kind.lock() {
            WindowKind::Count(window) => window.aggregate(),
            WindowKind::Time(window) => window.aggregate(self.epoch_second()),
        };
        self.to_snapshot(&aggregate)
    }

    /// Drop all buffered outcomes.
    pub fn reset(&self) {
        match &mut *self.kind.lock() {
            WindowKind::Count(window) => window.reset(),
            WindowKind::Time(window) => window.reset(),
        }
    }

    fn check(&self, aggregate: &Aggregate) -> ThresholdCheck {
        if aggregate.total_calls < self.settings.minimum_number_of_calls {
            return ThresholdCheck::BelowMinimumCalls;
        }
        let failure_rate = rate(aggregate.failed_calls, aggregate.total_calls);
        let slow_call_rate = rate(aggregate.slow_calls, aggregate.total_calls);
        if failure_rate >= self.settings.failure_rate_threshold
            || slow_call_rate >= self.settings.slow_call_rate_threshold
        {
            ThresholdCheck::AboveThresholds
        } else {
            ThresholdCheck::BelowThresholds
        }
    }

    fn to_snapshot(&self, aggregate: &Aggregate) -> Snapshot {
        let enough = aggregate.total_calls >= self.settings.minimum_number_of_calls;
        Snapshot {
            total_calls: aggregate.total_calls,
            successful_calls: aggregate.total_calls - aggregate.failed_calls,
            failed_calls: aggregate.failed_calls,
            slow_calls: aggregate.slow_calls,
            slow_successful_calls: aggregate.slow_calls - aggregate.slow_failed_calls,
            slow_failed_calls: aggregate.slow_failed_calls,
            total_duration: Duration::from_nanos(aggregate.total_duration_nanos),
            failure_rate: if enough {
                rate(aggregate.failed_calls, aggregate.total_calls)
            } else {
                Snapshot::NOT_ENOUGH_DATA
            },
            slow_call_rate: if enough {
                rate(aggregate.slow_calls, aggregate.total_calls)
            } else {
                Snapshot::NOT_ENOUGH_DATA
            },
        }
    }
}

impl std::fmt::Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[allow(clippy::cast_precision_loss)]
fn rate(part: u64, total: u64) -> f32 {
    debug_assert!(total > 0);
    part as f32 * 100.0 / total as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::{MockClock, SystemClock};

    fn settings(min_calls: u64) -> WindowSettings {
        WindowSettings {
            minimum_number_of_calls: min_calls,
            slow_call_duration_threshold: Duration::from_millis(100),
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
        }
    }

    fn fast() -> Duration {
        Duration::from_millis(10)
    }

    #[test]
    fn test_rates_are_sentinel_below_minimum_calls() {
        let window = Window::count_based(4, settings(3), Arc::new(SystemClock));
        assert_eq!(
            window.record(fast(), Outcome::Failure),
            ThresholdCheck::BelowMinimumCalls
        );

        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_calls, 1);
        assert_eq!(snapshot.failure_rate, Snapshot::NOT_ENOUGH_DATA);
        assert_eq!(snapshot.slow_call_rate, Snapshot::NOT_ENOUGH_DATA);
    }

    #[test]
    fn test_failure_rate_crosses_threshold() {
        let window = Window::count_based(5, settings(5), Arc::new(SystemClock));
        window.record(fast(), Outcome::Failure);
        window.record(fast(), Outcome::Failure);
        window.record(fast(), Outcome::Failure);
        assert_eq!(
            window.record(fast(), Outcome::Success),
            ThresholdCheck::BelowMinimumCalls
        );
        assert_eq!(
            window.record(fast(), Outcome::Success),
            ThresholdCheck::AboveThresholds
        );

        let snapshot = window.snapshot();
        assert_eq!(snapshot.failure_rate, 60.0);
        assert_eq!(snapshot.successful_calls, 2);
        assert_eq!(snapshot.failed_calls, 3);
    }

    #[test]
    fn test_count_window_evicts_oldest() {
        let window = Window::count_based(2, settings(1), Arc::new(SystemClock));
        window.record(fast(), Outcome::Failure);
        window.record(fast(), Outcome::Success);
        // Evicts the failure: the window now holds [Success, Success].
        window.record(fast(), Outcome::Success);

        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_calls, 2);
        assert_eq!(snapshot.failed_calls, 0);
        assert_eq!(snapshot.failure_rate, 0.0);
    }

    #[test]
    fn test_slow_calls_classified_at_record_time() {
        let window = Window::count_based(4, settings(2), Arc::new(SystemClock));
        window.record(Duration::from_millis(100), Outcome::Success);
        window.record(Duration::from_millis(250), Outcome::Failure);
        window.record(Duration::from_millis(99), Outcome::Success);

        let snapshot = window.snapshot();
        assert_eq!(snapshot.slow_calls, 2);
        assert_eq!(snapshot.slow_successful_calls, 1);
        assert_eq!(snapshot.slow_failed_calls, 1);
        assert!((snapshot.slow_call_rate - 200.0 / 3.0).abs() < 0.01);
    }

    #[test]
    fn test_time_window_expires_stale_epochs() {
        let clock = MockClock::new();
        let window = Window::time_based(2, settings(1), Arc::new(clock.clone()));

        window.record(fast(), Outcome::Failure);
        clock.advance(Duration::from_secs(1));
        window.record(fast(), Outcome::Success);
        assert_eq!(window.snapshot().total_calls, 2);

        // The failure's epoch slides out of the two-second window.
        clock.advance(Duration::from_secs(1));
        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_calls, 1);
        assert_eq!(snapshot.failed_calls, 0);

        clock.advance(Duration::from_secs(10));
        assert_eq!(window.snapshot().total_calls, 0);
    }

    #[test]
    fn test_reset_clears_all_outcomes() {
        let window = Window::count_based(8, settings(1), Arc::new(SystemClock));
        for _ in 0..5 {
            window.record(fast(), Outcome::Failure);
        }
        window.reset();

        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_calls, 0);
        assert_eq!(snapshot.total_duration, Duration::ZERO);
    }

    // total = successful + failed and slow <= total, for any recording
    // sequence and both variants.
    #[test]
    fn test_aggregate_identities_hold() {
        let clock = MockClock::new();
        let windows = [
            Window::count_based(7, settings(3), Arc::new(SystemClock)),
            Window::time_based(3, settings(3), Arc::new(clock.clone())),
        ];
        for window in &windows {
            for i in 0..50u64 {
                let duration = Duration::from_millis(i * 7 % 230);
                let outcome = if i % 3 == 0 {
                    Outcome::Failure
                } else {
                    Outcome::Success
                };
                window.record(duration, outcome);
                clock.advance(Duration::from_millis(400));

                let s = window.snapshot();
                assert_eq!(s.total_calls, s.successful_calls + s.failed_calls);
                assert!(s.slow_calls <= s.total_calls);
                assert_eq!(s.slow_calls, s.slow_successful_calls + s.slow_failed_calls);
            }
        }
    }

    #[test]
    fn test_parallel_recording_loses_no_updates() {
        let window = Arc::new(Window::count_based(1024, settings(1), Arc::new(SystemClock)));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let window = Arc::clone(&window);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let outcome = if worker % 2 == 0 {
                            Outcome::Success
                        } else {
                            Outcome::Failure
                        };
                        window.record(fast(), outcome);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_calls, 800);
        assert_eq!(snapshot.successful_calls, 400);
        assert_eq!(snapshot.failed_calls, 400);
    }
}
