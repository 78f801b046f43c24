//! Backoff schedules for the retry attempt loop

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Computes the wait before each re-attempt.
///
/// `multiplier == 1.0` is a fixed schedule; larger multipliers grow the
/// wait exponentially as `initial * multiplier^(n-1)`. Every computed
/// interval is capped at `max_interval`, and jitter never drives it
/// negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalStrategy {
    /// Wait before the first re-attempt
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Fraction of the computed interval added as jitter, in `[0, 1]`
    pub jitter_factor: f64,
    /// Cap on the computed interval
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
}

impl Default for IntervalStrategy {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(500))
    }
}

impl IntervalStrategy {
    /// The same wait before every re-attempt.
    #[must_use]
    pub fn fixed(wait: Duration) -> Self {
        Self {
            initial_interval: wait,
            multiplier: 1.0,
            jitter_factor: 0.0,
            max_interval: wait,
        }
    }

    /// Exponentially growing waits: `initial * multiplier^(n-1)`.
    #[must_use]
    pub fn exponential(initial: Duration, multiplier: f64) -> Self {
        Self {
            initial_interval: initial,
            multiplier: multiplier.max(1.0),
            jitter_factor: 0.0,
            max_interval: initial.saturating_mul(64),
        }
    }

    /// Cap the computed interval.
    #[must_use]
    pub fn with_max_interval(mut self, max: Duration) -> Self {
        self.max_interval = max;
        self
    }

    /// Spread repeated attempts by adding up to `factor` of the computed
    /// interval, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Wait before re-attempt number `attempt` (1-based: the wait served
    /// after the `attempt`-th failed call).
    #[must_use]
    pub fn interval_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1);
        let scaled = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent as i32);
        let mut interval = Duration::try_from_secs_f64(scaled).unwrap_or(self.max_interval);

        if self.jitter_factor > 0.0 {
            // Hash-derived jitter: no RNG dependency, different per
            // process run, stable within one computation.
            use std::collections::hash_map::RandomState;
            use std::hash::{BuildHasher, Hash, Hasher};

            let mut hasher = RandomState::new().build_hasher();
            attempt.hash(&mut hasher);
            let unit = (hasher.finish() % 1024) as f64 / 1024.0;
            let jitter = interval.as_secs_f64() * self.jitter_factor * unit;
            interval =
                Duration::try_from_secs_f64(interval.as_secs_f64() + jitter).unwrap_or(interval);
        }

        interval.min(self.max_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_schedule_is_constant() {
        let strategy = IntervalStrategy::fixed(Duration::from_millis(200));
        for attempt in 1..10 {
            assert_eq!(strategy.interval_for(attempt), Duration::from_millis(200));
        }
    }

    #[test]
    fn test_exponential_schedule_doubles() {
        let strategy = IntervalStrategy::exponential(Duration::from_millis(500), 2.0);
        assert_eq!(strategy.interval_for(1), Duration::from_millis(500));
        assert_eq!(strategy.interval_for(2), Duration::from_millis(1000));
        assert_eq!(strategy.interval_for(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_interval_is_capped() {
        let strategy = IntervalStrategy::exponential(Duration::from_secs(1), 10.0)
            .with_max_interval(Duration::from_secs(5));
        assert_eq!(strategy.interval_for(4), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let strategy =
            IntervalStrategy::fixed(Duration::from_millis(100)).with_jitter(0.5);
        for attempt in 1..20 {
            let interval = strategy.interval_for(attempt);
            assert!(interval >= Duration::from_millis(100));
            // Cap applies after jitter.
            assert!(interval <= Duration::from_millis(100));
        }

        let uncapped = IntervalStrategy {
            initial_interval: Duration::from_millis(100),
            multiplier: 1.0,
            jitter_factor: 0.5,
            max_interval: Duration::from_secs(1),
        };
        for attempt in 1..20 {
            let interval = uncapped.interval_for(attempt);
            assert!(interval >= Duration::from_millis(100));
            assert!(interval <= Duration::from_millis(150));
        }
    }
}
