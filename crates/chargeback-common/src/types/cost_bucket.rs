//! Aggregated cost per resource, SKU and time bucket

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::time_range::TimeRange;

/// Whether a cost is attributed directly or shared across consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostType {
    Usage,
    Shared,
}

impl CostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostType::Usage => "usage",
            CostType::Shared => "shared",
        }
    }
}

impl fmt::Display for CostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregation key: one bucket per (resource, SKU, bucket start)
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub resource_id: String,
    pub sku: String,
    /// Bucket boundary (Unix millis, aligned to the bucket width)
    pub bucket_start: i64,
}

impl BucketKey {
    pub fn new(resource_id: impl Into<String>, sku: impl Into<String>, bucket_start: i64) -> Self {
        Self {
            resource_id: resource_id.into(),
            sku: sku.into(),
            bucket_start,
        }
    }
}

/// Accumulated cost and quantity for one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBucket {
    pub key: BucketKey,
    /// Bucket window, `[bucket_start, bucket_start + width)`
    pub window: TimeRange,
    pub cost: Decimal,
    pub quantity: Decimal,
    pub currency: String,
    pub cost_type: CostType,
    /// Number of usage record slices folded into this bucket
    pub record_count: u32,
    /// Sealed buckets never change again
    pub sealed: bool,
}

impl CostBucket {
    pub fn new(key: BucketKey, width_ms: i64, currency: impl Into<String>, cost_type: CostType) -> Self {
        let window = TimeRange {
            start: key.bucket_start,
            end: key.bucket_start + width_ms,
        };
        Self {
            key,
            window,
            cost: Decimal::ZERO,
            quantity: Decimal::ZERO,
            currency: currency.into(),
            cost_type,
            record_count: 0,
            sealed: false,
        }
    }

    pub fn accumulate(&mut self, cost: Decimal, quantity: Decimal) {
        self.cost += cost;
        self.quantity += quantity;
        self.record_count += 1;
    }

    /// Mark sealed once the window has closed by `now` (with settle delay)
    pub fn seal_if_closed(&mut self, now: i64, seal_delay_ms: i64) {
        if !self.sealed && self.window.end + seal_delay_ms <= now {
            self.sealed = true;
        }
    }

    /// Same accumulated value, ignoring seal state and decimal scale
    pub fn same_value(&self, other: &CostBucket) -> bool {
        self.key == other.key
            && self.cost.normalize() == other.cost.normalize()
            && self.quantity.normalize() == other.quantity.normalize()
            && self.currency == other.currency
            && self.cost_type == other.cost_type
    }
}
