//! Time-based sliding window: per-second partial aggregates

use super::Aggregate;

/// Ring of one-second partial aggregates covering the last N seconds.
/// Advancing to a newer epoch clears every bucket that slid out of the
/// window and subtracts it from the running total, so the total stays an
/// O(1) read. Bucket `epoch % N` always holds the partials of the most
/// recent epoch congruent to it that the window has advanced through.
pub(crate) struct TimeWindow {
    buckets: Box<[Aggregate]>,
    total: Aggregate,
    /// Most recent epoch the window has advanced to.
    head_epoch: u64,
}

impl TimeWindow {
    pub(crate) fn new(seconds: usize) -> Self {
        assert!(seconds >= 1, "window length must be at least 1 second");
        Self {
            buckets: vec![Aggregate::default(); seconds].into_boxed_slice(),
            total: Aggregate::default(),
            head_epoch: 0,
        }
    }

    /// Clear buckets whose epoch fell out of `(now_epoch - N, now_epoch]`.
    fn advance(&mut self, now_epoch: u64) {
        if now_epoch <= self.head_epoch {
            return;
        }
        let span = self.buckets.len() as u64;
        if now_epoch - self.head_epoch >= span {
            // Everything buffered is stale.
            self.buckets.fill(Aggregate::default());
            self.total = Aggregate::default();
        } else {
            for epoch in (self.head_epoch + 1)..=now_epoch {
                let bucket = &mut self.buckets[(epoch % span) as usize];
                self.total.subtract(bucket);
                *bucket = Aggregate::default();
            }
        }
        self.head_epoch = now_epoch;
    }

    pub(crate) fn record(
        &mut self,
        now_epoch: u64,
        duration_nanos: u64,
        failed: bool,
        slow: bool,
    ) -> Aggregate {
        self.advance(now_epoch);
        let span = self.buckets.len() as u64;
        self.buckets[(now_epoch % span) as usize].add(duration_nanos, failed, slow);
        self.total.add(duration_nanos, failed, slow);
        self.total
    }

    pub(crate) fn aggregate(&mut self, now_epoch: u64) -> Aggregate {
        self.advance(now_epoch);
        self.total
    }

    pub(crate) fn reset(&mut self) {
        self.buckets.fill(Aggregate::default());
        self.total = Aggregate::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_epoch_accumulates() {
        let mut window = TimeWindow::new(5);
        window.record(0, 10, false, false);
        window.record(0, 20, true, false);
        let total = window.record(0, 30, true, true);
        assert_eq!(total.total_calls, 3);
        assert_eq!(total.failed_calls, 2);
        assert_eq!(total.slow_calls, 1);
        assert_eq!(total.total_duration_nanos, 60);
    }

    #[test]
    fn test_stale_epochs_slide_out() {
        let mut window = TimeWindow::new(3);
        window.record(0, 10, true, false);
        window.record(1, 20, false, false);
        window.record(2, 30, false, false);
        assert_eq!(window.aggregate(2).total_calls, 3);

        // Epoch 3 pushes epoch 0 (the failure) out.
        let total = window.aggregate(3);
        assert_eq!(total.total_calls, 2);
        assert_eq!(total.failed_calls, 0);
        assert_eq!(total.total_duration_nanos, 50);
    }

    #[test]
    fn test_long_gap_clears_everything() {
        let mut window = TimeWindow::new(3);
        window.record(0, 10, true, true);
        window.record(1, 10, true, true);
        assert_eq!(window.aggregate(100).total_calls, 0);

        // Recording keeps working after a full clear.
        let total = window.record(101, 5, false, false);
        assert_eq!(total.total_calls, 1);
    }

    #[test]
    fn test_aggregate_is_idempotent_within_an_epoch() {
        let mut window = TimeWindow::new(4);
        window.record(7, 10, false, false);
        let a = window.aggregate(7);
        let b = window.aggregate(7);
        assert_eq!(a, b);
    }
}
