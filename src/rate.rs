//! Windowed rate estimator over a stream of `(value, time)` samples.
use std::collections::VecDeque;

use crate::time::{LocalDuration, LocalTime};

/// Default trailing window over which the rate is computed.
pub const DEFAULT_WINDOW: LocalDuration = LocalDuration::from_secs(30);
/// Default hard cap on the number of retained samples.
pub const DEFAULT_CAP: usize = 100;

/// Tracks a rate (units per second) over a bounded trailing window of samples.
///
/// `update` silently drops samples once the cap is reached rather than evicting
/// older ones to make room — the cap is a backstop against unbounded growth
/// from a caller that never lets the window age samples out, not a ring buffer.
pub struct RateEstimator {
    samples: VecDeque<(f64, LocalTime)>,
    window: LocalDuration,
    cap: usize,
}

impl RateEstimator {
    /// Create an estimator with the given window and sample cap.
    pub fn new(window: LocalDuration, cap: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            cap,
        }
    }

    /// Record a new sample, if under the cap. Does nothing otherwise.
    pub fn update(&mut self, value: f64, time: LocalTime) {
        if self.samples.len() < self.cap {
            self.samples.push_back((value, time));
        }
    }

    /// Ages out samples older than the window, then returns the mean of
    /// what remains, or `0.0` if fewer than two samples are left.
    pub fn value(&mut self, now: LocalTime) -> f64 {
        while let Some(&(_, time)) = self.samples.front() {
            match now.duration_since(time) {
                Ok(age) if age > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }

        if self.samples.len() < 2 {
            return 0.0;
        }

        let sum: f64 = self.samples.iter().map(|(v, _)| v).sum();

        sum / self.samples.len() as f64
    }

    /// Discard all samples.
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn t(secs: u64) -> LocalTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn two_samples_one_second_apart() {
        let mut rate = RateEstimator::new(Duration::from_secs(30), 100);
        rate.update(10.0, t(0));
        rate.update(10.0, t(1));

        assert_eq!(rate.value(t(1)), 10.0);
    }

    #[test]
    fn single_sample_is_zero() {
        let mut rate = RateEstimator::new(Duration::from_secs(30), 100);
        rate.update(10.0, t(0));

        assert_eq!(rate.value(t(0)), 0.0);
    }

    #[test]
    fn samples_older_than_window_are_excluded() {
        let mut rate = RateEstimator::new(Duration::from_secs(5), 100);
        rate.update(10.0, t(0));
        rate.update(10.0, t(1));

        // Far enough past the window that both age out, leaving < 2 samples.
        assert_eq!(rate.value(t(100)), 0.0);
    }

    #[test]
    fn updates_above_cap_are_silently_dropped() {
        let mut rate = RateEstimator::new(Duration::from_secs(30), 2);
        rate.update(1.0, t(0));
        rate.update(1.0, t(1));
        rate.update(1.0, t(2)); // dropped, already at cap

        assert_eq!(rate.value(t(2)), 1.0); // rate over the first two samples only
    }

    #[test]
    fn reset_clears_samples() {
        let mut rate = RateEstimator::new(Duration::from_secs(30), 100);
        rate.update(10.0, t(0));
        rate.update(10.0, t(1));
        rate.reset();

        assert_eq!(rate.value(t(1)), 0.0);
    }
}
