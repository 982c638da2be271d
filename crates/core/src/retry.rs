//! Retry policy and backoff for projection tasks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Default number of failures after which a task is dead-lettered.
pub const DEFAULT_MAX_RETRY: u32 = 8;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * 2^(n-1)`, capped at `max_delay`
    #[default]
    Exponential,
    /// Always `base`
    Fixed,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// A task whose failure count reaches this value is dead-lettered
    pub max_retry: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    /// 1s, 2s, 4s, ... 64s, then 120s; eight failures dead-letter the task.
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with exponential backoff.
    pub fn exponential(max_retry: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retry,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_retry: u32, delay: Duration) -> Self {
        Self {
            max_retry,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Delay before the attempt that follows the `failures`-th failure.
    ///
    /// Zero for `failures == 0`; otherwise non-decreasing in `failures` and
    /// never above `max_delay`.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                // 2^31 already exceeds any sane cap; clamp the shift so the
                // multiplier itself cannot overflow.
                let shift = (failures - 1).min(31);
                self.base_delay
                    .checked_mul(1u32 << shift)
                    .unwrap_or(self.max_delay)
            }
        };

        delay.min(self.max_delay)
    }

    /// Whether a task about to record its `next_retry`-th failure is out of retries.
    pub fn is_exhausted(&self, next_retry: u32) -> bool {
        next_retry >= self.max_retry
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.max_retry == 0 {
            return Err(DomainError::validation("max_retry must be at least 1"));
        }
        if self.base_delay.is_zero() {
            return Err(DomainError::validation("base_delay must be positive"));
        }
        if self.max_delay < self.base_delay {
            return Err(DomainError::validation(format!(
                "max_delay ({:?}) must not be below base_delay ({:?})",
                self.max_delay, self.base_delay
            )));
        }
        Ok(())
    }
}
