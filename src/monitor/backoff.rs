//! Delay policy for a folder monitor after failed scans.

use std::time::Duration;

/// Linear backoff with a ceiling: the n-th consecutive failure waits
/// `min(base * n, max)` before the next scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Normal poll interval, also the backoff step
    pub base: Duration,
    /// Upper bound on any single delay
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the next tick after `consecutive_failures` failures in a row.
    ///
    /// Zero failures means the regular interval.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.base;
        }
        let scaled = self
            .base
            .checked_mul(consecutive_failures)
            .unwrap_or(Duration::MAX);
        scaled.min(self.max)
    }
}
