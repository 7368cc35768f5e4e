//! Retry classification and exponential backoff.

use crate::error::{DbError, ErrorKind};
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Retry policy applied by the resilience engine to every attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for the un-jittered delay
    pub max_delay: Duration,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
    /// Error kinds eligible for retry when classified transient
    pub retryable: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.1,
            retryable: [
                ErrorKind::Connection,
                ErrorKind::Timeout,
                ErrorKind::PoolTimeout,
                ErrorKind::QueryExecution,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether a failure after `attempts_made` attempts earns another try.
    pub fn should_retry(&self, err: &DbError, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
            && err.is_retryable()
            && self.retryable.contains(&err.kind())
    }

    /// Delay before retry number `retry_index` (0-based) for a jitter sample
    /// `unit` in `-1.0..=1.0`.
    pub fn backoff_with(&self, retry_index: u32, unit: f64) -> Duration {
        let exp = 2f64.powi(retry_index.min(63) as i32);
        let base = self.base_delay.as_secs_f64() * exp;
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = self.jitter_factor.clamp(0.0, 1.0) * unit.clamp(-1.0, 1.0);
        Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
    }

    /// Delay before retry number `retry_index`, with random jitter.
    pub fn backoff(&self, retry_index: u32) -> Duration {
        let unit = if self.jitter_factor > 0.0 {
            rand::rng().random_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.backoff_with(retry_index, unit)
    }
}
