//! # Chargeback Common
//!
//! Shared types and errors for the chargeback metrics exporter.
//!
//! ## Core Types
//!
//! - [`TimeRange`]: half-open `[start, end)` windows in Unix milliseconds
//! - [`UsageRecord`]: one billing line fetched from the provider
//! - [`CostBucket`]: cost accumulated per (resource, SKU, time bucket)
//! - [`MetricSample`]: exposition unit derived 1:1 from a bucket
//! - [`ReadinessState`]: the single externally visible health signal

pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{BackfillError, BillingError, ChargebackError, Result};
pub use types::{
    cost_bucket::{BucketKey, CostBucket, CostType},
    metric_sample::{bucket_cost_metric, MetricSample, BUCKET_COST_SUFFIX, LABEL_NAMES},
    readiness::ReadinessState,
    time_range::{align_down, align_up, TimeRange},
    usage_record::UsageRecord,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One hour in milliseconds
pub const HOUR_MS: i64 = 3_600_000;

/// Default bucket width: the billing API's hourly granularity
pub const DEFAULT_BUCKET_WIDTH_MS: i64 = HOUR_MS;

/// Default store block duration (the store's minimum block range)
pub const DEFAULT_BLOCK_DURATION_MS: i64 = 2 * HOUR_MS;

/// Currency assumed when the provider omits one
pub const DEFAULT_CURRENCY: &str = "USD";
