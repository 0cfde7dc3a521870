//! Retry/backoff policy.
//!
//! `attempts` is the post-increment count of the attempt that just failed.
//! Once it reaches `max_attempts` the failure is terminal; otherwise the job
//! waits `base_delay * 2^attempts`.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::add_duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back to `pending`, eligible at the given time.
    RetryAt(DateTime<Utc>),
    /// No attempts left; fail permanently.
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// `base_delay * 2^attempts`, capped at `max_delay`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn decide(&self, attempts: u32, now: DateTime<Utc>) -> RetryDecision {
        if self.is_exhausted(attempts) {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAt(add_duration(now, self.delay_for(attempts)))
        }
    }
}
