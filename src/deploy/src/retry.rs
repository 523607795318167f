//! Bounded exponential backoff for operations racing webhook or CNI propagation.

use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default upper bound for a single backoff sleep.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Backoff parameters for one call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt. Each retry is preceded by a sleep.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sleep before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..retry {
            delay = self.next_delay(delay);
        }
        delay
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max_delay)
    }

    /// Total time spent sleeping when every retry is used.
    pub fn total_backoff(&self) -> Duration {
        (1..=self.max_retries).map(|r| self.delay_for(r)).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(3))
    }
}

/// Run `operation` until it succeeds, fails fatally, or retries run out.
///
/// Only errors whose backend tag is retryable are retried. Cancellation
/// interrupts a backoff sleep immediately and yields [`DeployError::Cancelled`].
pub async fn retry<T, F, Fut>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.initial_delay.min(policy.max_delay);
    let mut retries = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }

        let error = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    tracing::info!("[Retry] {} succeeded after {} retries", label, retries);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            tracing::debug!("[Retry] {} failed with a fatal error: {}", label, error);
            return Err(error);
        }

        if retries >= policy.max_retries {
            return Err(DeployError::RetriesExhausted {
                label: label.to_string(),
                retries,
                source: Box::new(error),
            });
        }

        retries += 1;
        tracing::warn!(
            "[Retry] {} hit a transient error (retry {}/{} in {:?}): {}",
            label,
            retries,
            policy.max_retries,
            delay,
            error
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("[Retry] {} cancelled during backoff", label);
                return Err(DeployError::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }

        delay = policy.next_delay(delay);
    }
}
