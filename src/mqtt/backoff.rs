//! Retry schedule for failed connect attempts.
//!
//! Retrying is opt-in per connect call: it only happens when the options carry a
//! reconnect delay. That delay is the first wait; every further wait grows by
//! `multiplier` up to `max_delay_secs`, and after `max_retries` retries the connect
//! gives up and reports the last failure.
//!
//! ```text
//! delay[n] = min(reconnect_delay * multiplier^(n-1), max(max_delay, reconnect_delay))
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackoffError {
    #[error("Maximum number of retries exceeded: {0}")]
    MaxRetriesExceeded(u32),
}

/// Application-wide knobs for the retry schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Growth factor per retry; values below 1.0 keep the delay constant
    pub multiplier: f64,
    /// Upper bound for a single wait
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            multiplier: 2.0,
            max_delay_secs: 60,
        }
    }
}

impl RetryPolicy {
    /// Schedule starting at `initial`, the reconnect delay of one connect call.
    pub fn backoff(&self, initial: Duration) -> Backoff {
        Backoff::new(
            initial,
            Duration::from_secs(self.max_delay_secs),
            self.multiplier,
            self.max_retries,
        )
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_retries: u32,
    retry: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max_delay: Duration, multiplier: f64, max_retries: u32) -> Self {
        Self {
            current_delay: initial,
            // A cap below the configured delay would shorten the very first wait
            max_delay: max_delay.max(initial),
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
            max_retries,
            retry: 0,
        }
    }

    /// Returns the wait before the next retry and advances the schedule.
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        if self.retry >= self.max_retries {
            return Err(BackoffError::MaxRetriesExceeded(self.max_retries));
        }
        self.retry += 1;

        let sleep = self.current_delay;
        let next = self.current_delay.as_secs_f64() * self.multiplier;
        self.current_delay = if next >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(next)
        };

        Ok(sleep)
    }

    /// Retries handed out so far.
    pub fn retry(&self) -> u32 {
        self.retry
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
