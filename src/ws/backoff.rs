//! Reconnect delay schedule.

use std::time::Duration;

use backoff::backoff::Backoff;

use super::config::ReconnectConfig;

/// Attempt-counting backoff used between reconnection attempts.
///
/// Unlike [`backoff::ExponentialBackoff`] there is no jitter: attempt `n`
/// waits exactly `min(base × 2^(n−1), max_delay)`, or `base` when exponential
/// mode is off. Once `max_attempts` delays have been handed out,
/// [`Backoff::next_backoff`] returns `None` until [`Backoff::reset`].
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max_delay: Duration,
    exponential: bool,
    max_attempts: u32,
    attempt: u32,
}

impl ReconnectBackoff {
    /// Delay for the given 1-based attempt number.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.base;
        }

        let exponent = attempt.saturating_sub(1);
        2_u32
            .checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Number of attempts handed out since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

impl Backoff for ReconnectBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        Some(self.delay_for(self.attempt))
    }
}

impl From<ReconnectConfig> for ReconnectBackoff {
    fn from(config: ReconnectConfig) -> Self {
        Self {
            base: config.base_interval,
            max_delay: config.max_delay,
            exponential: config.exponential,
            max_attempts: config.max_attempts,
            attempt: 0,
        }
    }
}
