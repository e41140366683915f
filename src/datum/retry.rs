use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::WorkerError;

/// Decides whether a failed attempt is retried and how long it waits first.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// `retries_used` is the number of retries already consumed by the datum.
    pub fn should_retry(&self, err: &WorkerError, retries_used: u32) -> bool {
        err.is_retryable() && retries_used < self.config.max_retries
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        if self.config.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let exp = retry.saturating_sub(1).min(32) as i32;
        let secs = self.config.initial_backoff.as_secs_f64() * self.config.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.config.max_backoff.as_secs_f64() {
            return self.config.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }

    /// [`backoff`](Self::backoff) spread over +/-20% so retried datums of one
    /// job do not hit the store in lockstep.
    pub fn backoff_with_jitter(&self, retry: u32) -> Duration {
        let base = self.backoff(retry);
        if base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.8..=1.2);
        base.mul_f64(factor).min(self.config.max_backoff)
    }
}
