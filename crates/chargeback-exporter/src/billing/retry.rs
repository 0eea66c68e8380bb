//! Retry utility with capped exponential backoff for billing requests
//!
//! Only errors reporting `is_retryable()` are retried. Rate limit responses
//! carrying `Retry-After` wait at least that long (still capped).

use std::future::Future;
use std::time::Duration;

use chargeback_common::BillingError;
use tokio::time::sleep;

use crate::config::BillingSettings;

/// Backoff schedule: `initial * 2^(attempt-1)`, capped at `max_backoff`
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &BillingSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    fn delay_for(&self, retry: u32, err: &BillingError) -> Duration {
        let backoff = self.backoff(retry);
        match err {
            BillingError::RateLimited {
                retry_after: Some(after),
            } => (*after).max(backoff).min(self.max_backoff),
            _ => backoff,
        }
    }
}

/// Run `operation` until it succeeds, fails non-retryably, or exhausts attempts
pub async fn retry_with_backoff<F, T, Fut>(
    policy: &RetryPolicy,
    description: &str,
    mut operation: F,
) -> Result<T, BillingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BillingError>>,
{
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(
                        operation = description,
                        attempts = attempt,
                        "Billing request succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt, &e);
                tracing::warn!(
                    operation = description,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Billing request failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        operation = description,
                        attempts = attempt,
                        error = %e,
                        "Billing request failed after exhausting retries"
                    );
                }
                return Err(e);
            }
        }
    }
}
