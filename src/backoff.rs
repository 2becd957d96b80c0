//! Randomized exponential backoff for reconnection sequences.
//!
//! Each reconnection sequence gets its own [`Backoff`]; state is never shared
//! across devices or reused after exhaustion. The delay for attempt *n* is
//! `min(base * 2^(n-1), max)` plus uniform jitter of up to `jitter_factor`
//! times the capped delay.

use std::time::Duration;

/// Tuning knobs for [`Backoff`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Attempts before the sequence is exhausted.
    pub max_attempts: u32,
    /// Fraction of the capped delay added as uniform random jitter.
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            jitter_factor: 0.5,
        }
    }
}

impl BackoffConfig {
    /// Quick retries with little jitter, for trusted local networks.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 15,
            jitter_factor: 0.3,
        }
    }

    /// Slow retries with more jitter, to conserve battery and radio time.
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            max_attempts: 5,
            jitter_factor: 0.5,
        }
    }
}

/// Exponential backoff state for one retry sequence.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Advances to the next attempt and returns its delay, or `None` once
    /// `max_attempts` have been consumed.
    pub fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }

        self.attempt += 1;
        Some(self.delay_for(self.attempt))
    }

    /// Computes the delay for the current attempt without advancing.
    ///
    /// Display/preview only: the jitter is drawn fresh, so the value will not
    /// match what a subsequent [`next`](Self::next) returns exactly.
    #[must_use]
    pub fn peek(&self) -> Duration {
        self.delay_for(self.attempt.max(1))
    }

    /// Zeroes the attempt counter after a confirmed successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempt number, 1-indexed after the first call to [`next`](Self::next).
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let exponential = self.config.base_delay.as_secs_f64() * 2_f64.powi(exponent as i32);
        let capped = exponential.min(self.config.max_delay.as_secs_f64());

        let jitter = fastrand::f64() * capped * self.config.jitter_factor;
        Duration::from_secs_f64(capped + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(base: u64, max: u64, attempts: u32) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_secs(base),
            max_delay: Duration::from_secs(max),
            max_attempts: attempts,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn doubles_until_capped() {
        let mut backoff = Backoff::new(no_jitter(1, 60, 10));
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60, 60]);
    }

    #[test]
    fn exhausts_exactly_after_max_attempts() {
        let mut backoff = Backoff::new(no_jitter(1, 60, 3));
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert!(!backoff.is_exhausted());
        assert!(backoff.next().is_some());
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.next(), None);
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn reset_behaves_like_a_fresh_sequence() {
        let mut backoff = Backoff::new(no_jitter(1, 60, 10));
        for _ in 0..5 {
            backoff.next();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.attempt(), 1);
    }

    #[test]
    fn jitter_stays_within_the_configured_fraction() {
        let config = BackoffConfig {
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(60),
            max_attempts: 1,
            jitter_factor: 0.5,
        };
        for _ in 0..100 {
            let mut backoff = Backoff::new(config);
            let delay = backoff.next().unwrap().as_secs_f64();
            assert!((4.0..=6.0).contains(&delay), "delay out of range: {delay}");
        }
    }

    #[test]
    fn peek_does_not_advance() {
        let mut backoff = Backoff::new(no_jitter(2, 60, 10));
        assert_eq!(backoff.peek(), Duration::from_secs(2));
        assert_eq!(backoff.attempt(), 0);
        backoff.next();
        backoff.next();
        assert_eq!(backoff.peek(), Duration::from_secs(4));
        assert_eq!(backoff.attempt(), 2);
    }

    #[test]
    fn presets_differ_in_the_expected_direction() {
        let aggressive = BackoffConfig::aggressive();
        let conservative = BackoffConfig::conservative();
        assert!(aggressive.base_delay < conservative.base_delay);
        assert!(aggressive.max_attempts > conservative.max_attempts);
        assert!(aggressive.jitter_factor < conservative.jitter_factor);
    }
}
