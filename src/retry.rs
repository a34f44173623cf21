//! Backoff computation and retryability.

use std::sync::Arc;

use crate::clock::RandomSource;
use crate::config::{BackoffKind, RetryConfig};
use crate::error::BoxError;

/// Computes backoff delays and applies the retryability predicate. The retry
/// loop itself lives in the orchestrator; this type holds no mutable state.
pub struct RetryHandler {
    config: RetryConfig,
    rng: Arc<dyn RandomSource>,
}

impl RetryHandler {
    pub fn new(config: RetryConfig, rng: Arc<dyn RandomSource>) -> Self {
        Self { config, rng }
    }

    /// Total attempts, including the initial call.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay in seconds to sleep before attempt `attempt + 1`, where
    /// `attempt` is the zero-indexed attempt that just failed.
    pub fn compute_delay(&self, attempt: u32) -> f64 {
        let exp_delay = |base: f64| -> f64 {
            (base * 2f64.powi(attempt.min(i32::MAX as u32) as i32)).min(self.config.max_delay)
        };
        match self.config.backoff {
            BackoffKind::Fixed => self.config.base_delay,
            BackoffKind::Exponential => exp_delay(self.config.base_delay),
            BackoffKind::ExponentialJitter => {
                self.rng.uniform(0.0, exp_delay(self.config.base_delay))
            }
        }
    }

    /// Whether the fault should be retried. Defaults to true when no
    /// predicate is configured.
    pub fn is_retryable(&self, err: &BoxError) -> bool {
        match &self.config.retryable {
            Some(predicate) => predicate(err),
            None => true,
        }
    }
}
