//! Aggregation module
//!
//! Turns usage records into cost buckets and keeps the rolling cache.

pub mod aggregator;
pub mod cache;

pub use aggregator::{AggregationOutcome, AggregationRules, CostAggregator};
pub use cache::{BucketCache, BucketSnapshot, MergeStats};
