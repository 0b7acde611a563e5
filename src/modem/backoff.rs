//! Reconnect backoff
//!
//! Exponential delays between connect attempts, built on `backon`'s
//! exponential builder: the first delay is `min`, each following one is
//! multiplied by `factor` and capped at `max`. `reset` starts over at `min`.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    pub min: Duration,
    pub max: Duration,
    pub factor: f32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(300),
            factor: 2.0,
        }
    }
}

pub struct Backoff {
    builder: ExponentialBuilder,
    current: ExponentialBackoff,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(settings: &BackoffSettings) -> Self {
        let min = settings.min;
        let max = settings.max.max(min);
        let builder = ExponentialBuilder::default()
            .with_min_delay(min)
            .with_max_delay(max)
            .with_factor(settings.factor.max(1.0))
            .without_max_times();
        Self {
            current: builder.clone().build(),
            builder,
            min,
            max,
        }
    }

    /// Delay before the next attempt; grows on every call.
    pub fn next_delay(&mut self) -> Duration {
        self.current
            .next()
            .unwrap_or(self.max)
            .clamp(self.min, self.max)
    }

    /// Back to the minimum delay, after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.builder.clone().build();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(min_ms: u64, max_ms: u64, factor: f32) -> BackoffSettings {
        BackoffSettings {
            min: Duration::from_millis(min_ms),
            max: Duration::from_millis(max_ms),
            factor,
        }
    }

    #[test]
    fn starts_at_min_and_grows() {
        let mut backoff = Backoff::new(&settings(100, 10_000, 2.0));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        // growth goes through f32 seconds, allow rounding
        for expected_ms in [200u64, 400, 800] {
            let delay = backoff.next_delay().as_micros() as i128;
            let expected = i128::from(expected_ms) * 1_000;
            assert!((delay - expected).abs() < 1_000, "{delay}us != {expected}us");
        }
    }

    #[test]
    fn stays_within_bounds() {
        let s = settings(100, 1_000, 3.0);
        let mut backoff = Backoff::new(&s);
        let mut previous = Duration::ZERO;
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= s.min, "{delay:?} below minimum");
            assert!(delay <= s.max, "{delay:?} above maximum");
            assert!(delay >= previous, "delay shrank without a reset");
            previous = delay;
        }
        assert_eq!(previous, s.max);
    }

    #[test]
    fn reset_returns_to_min() {
        let mut backoff = Backoff::new(&settings(100, 10_000, 2.0));
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn max_below_min_is_raised_to_min() {
        let mut backoff = Backoff::new(&settings(500, 100, 2.0));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }
}
