//! Exponential backoff used for broker reconnects and publish retries.
//!
//! The delay grows geometrically from an initial value and saturates at a cap:
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```
//!
//! With `initial = 1s`, `multiplier = 2.0`, `max = 8s` the sequence is
//! `1s, 2s, 4s, 8s, 8s, ...`.
//!
//! When jitter is enabled each returned delay is drawn uniformly from
//! `[delay / 2, delay]`, so a jittered delay never exceeds the cap.
//!
//! # Examples
//!
//! ```ignore
//! use std::time::Duration;
//! use weatherbee_mqtt::Backoff;
//!
//! let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8), 2.0);
//! assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(1));
//! assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(2));
//!
//! backoff.reset();
//! assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(1));
//! ```

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// Error type for backoff exhaustion.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackoffError {
    /// The attempt budget is spent. Carries the configured limit.
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

/// Exponential backoff controller.
///
/// Every call to [`Backoff::next_sleep`] consumes one attempt and returns the
/// delay to wait before it. [`Backoff::reset`] starts the schedule over, which
/// the connection kernel does after each successful CONNACK.
///
/// Not shared between tasks by itself; the connection kernel keeps it behind a
/// mutex and the retry worker creates one per payload.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,

    /// Explicit attempt limit. `Some(0)` disables the limit entirely.
    max_attempts: Option<u32>,

    /// Limit used when no explicit one was set: the number of steps needed
    /// for the delay to reach `max_delay`.
    calculated_max_attempts: u32,

    jitter: bool,
}

impl Backoff {
    /// Creates a backoff schedule.
    ///
    /// `multiplier <= 1.0` or `initial >= max` yields a flat schedule with a
    /// calculated limit of a single attempt.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let calculated_max_attempts = Self::calculate_max_attempts(initial, max, multiplier);
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max,
            multiplier,
            attempt: 0,
            max_attempts: None,
            calculated_max_attempts,
            jitter: false,
        }
    }

    /// Number of steps until `initial * multiplier^n` reaches `max`, plus one.
    fn calculate_max_attempts(initial: Duration, max: Duration, multiplier: f64) -> u32 {
        if initial >= max || multiplier <= 1.0 || initial.is_zero() {
            return 1;
        }

        let n = (max.as_secs_f64() / initial.as_secs_f64()).log(multiplier);
        (n + 1e-9).floor() as u32 + 1
    }

    /// Sets an explicit attempt limit. `0` means unlimited.
    pub fn set_max_attempts(&mut self, max: u32) {
        self.max_attempts = Some(max);
    }

    /// Builder form of [`Backoff::set_max_attempts`].
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.set_max_attempts(max);
        self
    }

    /// Enables equal jitter on returned delays.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Starts the schedule over from the initial delay.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns the next delay and advances the schedule.
    ///
    /// Fails once the attempt limit is exceeded; the schedule is left as is,
    /// so every following call fails too until [`Backoff::reset`].
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        let effective_max = self.effective_max_attempts();
        if effective_max != 0 && self.attempt >= effective_max {
            return Err(BackoffError::MaxAttemptLimitError(effective_max));
        }
        self.attempt += 1;

        let sleep = self.current_delay;

        let next_delay_secs = self.current_delay.as_secs_f64() * self.multiplier;
        self.current_delay = if next_delay_secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(next_delay_secs)
        };

        Ok(self.apply_jitter(sleep.min(self.max_delay)))
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let upper = delay.as_secs_f64();
        let secs = rand::thread_rng().gen_range(upper / 2.0..=upper);
        Duration::from_secs_f64(secs)
    }

    fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(self.calculated_max_attempts)
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Attempts consumed since creation or the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn calculated_max_attempts(&self) -> u32 {
        self.calculated_max_attempts
    }

    /// Delay the next call would return, before jitter.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }
}

impl Default for Backoff {
    /// 1s initial, 60s cap, 10% growth per attempt.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 1.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_default_creation() {
        let backoff = Backoff::default();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current_delay(), Duration::from_secs(1));
        assert_eq!(backoff.max_delay(), Duration::from_secs(60));
        assert!(!backoff.jitter());
    }

    #[test]
    fn test_backoff_doubling_sequence_is_capped() {
        let mut backoff =
            Backoff::new(Duration::from_secs(1), Duration::from_secs(8), 2.0).with_max_attempts(0);

        let delays: Vec<_> = (0..6).map(|_| backoff.next_sleep().unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(8),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn test_backoff_gentle_progression() {
        let mut backoff = Backoff::default();

        let delay1 = backoff.next_sleep().unwrap();
        assert_eq!(delay1, Duration::from_secs(1));

        let delay2 = backoff.next_sleep().unwrap();
        assert!(delay2 > delay1);
        assert!(delay2 < Duration::from_secs_f64(1.2));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::default();

        backoff.next_sleep().unwrap();
        backoff.next_sleep().unwrap();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_max_attempts_exceeded() {
        let mut backoff = Backoff::default().with_max_attempts(2);

        assert!(backoff.next_sleep().is_ok());
        assert!(backoff.next_sleep().is_ok());
        assert_eq!(
            backoff.next_sleep(),
            Err(BackoffError::MaxAttemptLimitError(2))
        );
        assert_eq!(backoff.attempt(), 2);
        assert!(backoff.next_sleep().is_err());
    }

    #[test]
    fn test_backoff_zero_means_unlimited() {
        let mut backoff =
            Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 2.0).with_max_attempts(0);
        for _ in 0..1_000 {
            assert!(backoff.next_sleep().is_ok());
        }
    }

    #[test]
    fn test_backoff_calculated_max_attempts() {
        let backoff = Backoff::default();
        assert!(backoff.calculated_max_attempts() > 40);
        assert!(backoff.calculated_max_attempts() < 50);

        let doubling = Backoff::new(Duration::from_secs(1), Duration::from_secs(8), 2.0);
        assert_eq!(doubling.calculated_max_attempts(), 4);
    }

    #[test]
    fn test_backoff_degenerate_parameters() {
        let shrinking = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 0.9);
        assert_eq!(shrinking.calculated_max_attempts(), 1);

        let flat = Backoff::new(Duration::from_secs(10), Duration::from_secs(10), 1.5);
        assert_eq!(flat.calculated_max_attempts(), 1);
    }

    #[test]
    fn test_backoff_jitter_stays_within_half_and_full_delay() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8), 2.0)
            .with_max_attempts(0)
            .with_jitter(true);

        let expected = [1.0, 2.0, 4.0, 8.0, 8.0];
        for full in expected {
            let delay = backoff.next_sleep().unwrap().as_secs_f64();
            assert!(delay >= full / 2.0 - 1e-9, "{delay} below {}", full / 2.0);
            assert!(delay <= full + 1e-9, "{delay} above {full}");
        }
    }
}
