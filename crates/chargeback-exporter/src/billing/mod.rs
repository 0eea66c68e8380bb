//! Billing module
//!
//! Retrieves usage/cost records from the external billing API:
//! - BillingClient: authenticated, paginating HTTP client
//! - RetryPolicy: capped exponential backoff for transient failures
//! - wire: JSON page format

pub mod client;
pub mod retry;
pub mod wire;

use async_trait::async_trait;
use chargeback_common::{BillingError, TimeRange, UsageRecord};

pub use client::BillingClient;
pub use retry::{retry_with_backoff, RetryPolicy};

/// Source of usage records for a time window
#[async_trait]
pub trait BillingSource: Send + Sync {
    /// Fetch every record reported for `window`
    async fn fetch(&self, window: &TimeRange) -> Result<Vec<UsageRecord>, BillingError>;
}
