//! Retry policy for job bodies that fail unexpectedly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff between attempts of the same job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn no_retry() -> Self {
        Self::with_max_retries(0)
    }

    /// Total number of attempts a job gets, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry number `retry` (0-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(retry as i32);
        Duration::from_millis(base.min(self.max_delay_ms as f64) as u64)
    }

    /// Retries still available after `attempt` (1-indexed) has failed.
    pub fn retries_left(&self, attempt: u32) -> u32 {
        self.max_attempts().saturating_sub(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}
