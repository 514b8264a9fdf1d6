//! Bounded exponential backoff for lead submission.

use std::time::Duration;

/// Hard ceiling on attempts per `submit` call. Configuration cannot raise it.
pub const MAX_SUBMIT_ATTEMPTS: u32 = 3;

/// How many times to try and how long to wait between tries.
///
/// Delay before retry `n` (1-indexed) is
/// `min(initial_delay * backoff_multiplier^(n-1), max_delay)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first try. Clamped to [`MAX_SUBMIT_ATTEMPTS`].
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// immediate → 500ms → 1s
    pub const STANDARD: Self = Self {
        max_attempts: MAX_SUBMIT_ATTEMPTS,
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
    };

    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_SUBMIT_ATTEMPTS),
            initial_delay,
            ..Self::STANDARD
        }
    }

    /// Attempts actually permitted, never above the ceiling.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.clamp(1, MAX_SUBMIT_ATTEMPTS)
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed), or `None`
    /// when no attempts remain.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.attempts() {
            return None;
        }
        let multiplier = self.backoff_multiplier.powf((attempt - 1) as f64);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        Some(Duration::from_secs_f64(
            delay_secs.min(self.max_delay.as_secs_f64()),
        ))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::STANDARD
    }
}
