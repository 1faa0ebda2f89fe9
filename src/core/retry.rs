//! Retry policy with exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::job::duration_millis;

/// Retry policy for failed jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound for any single delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: Option<u64>,

    /// Treat a timeout like a failed attempt instead of a terminal outcome
    #[serde(default)]
    pub retry_on_timeout: bool,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_delay() -> Option<u64> {
    Some(30_000)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay(),
            retry_on_timeout: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Exponential backoff doubling from `base_delay`, capped at 30s
    pub fn exponential(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay_ms: duration_millis(base_delay),
            ..Default::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Option<Duration>) -> Self {
        self.max_delay_ms = max_delay.map(duration_millis);
        self
    }

    pub fn retry_on_timeout(mut self, enabled: bool) -> Self {
        self.retry_on_timeout = enabled;
        self
    }

    /// Delay before the retry that follows failed attempt `attempt` (0-indexed):
    /// `base_delay * multiplier^attempt`, capped at `max_delay_ms`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);

        let capped = match self.max_delay_ms {
            Some(max) => delay.min(max as f64),
            None => delay,
        };

        // Float-to-int casts saturate, so an overflowing delay becomes u64::MAX
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Check whether failed attempt `attempt` (0-indexed) may be retried
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
