//! Exposition samples derived from cost buckets

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use super::cost_bucket::CostBucket;

/// Label names attached to every chargeback sample, in exposition order
pub const LABEL_NAMES: [&str; 4] = ["resource_id", "sku", "cost_type", "currency"];

/// Suffix of the per-bucket cost gauge
pub const BUCKET_COST_SUFFIX: &str = "bucket_cost";

/// One exposition unit: (name, labels, value, timestamp)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    /// Label pairs, ordered as [`LABEL_NAMES`]
    pub labels: Vec<(String, String)>,
    pub value: f64,
    /// Sample timestamp (Unix millis), the bucket start
    pub timestamp_ms: i64,
}

impl MetricSample {
    /// Build the cost sample for a bucket
    pub fn from_bucket(prefix: &str, bucket: &CostBucket) -> Self {
        let values = [
            bucket.key.resource_id.as_str(),
            bucket.key.sku.as_str(),
            bucket.cost_type.as_str(),
            bucket.currency.as_str(),
        ];
        let labels = LABEL_NAMES
            .iter()
            .zip(values)
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();

        Self {
            name: bucket_cost_metric(prefix),
            labels,
            value: bucket.cost.to_f64().unwrap_or(f64::NAN),
            timestamp_ms: bucket.key.bucket_start,
        }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Fully qualified name of the bucket cost gauge
pub fn bucket_cost_metric(prefix: &str) -> String {
    format!("{prefix}_{BUCKET_COST_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::cost_bucket::{BucketKey, CostType};
    use crate::HOUR_MS;
    use rust_decimal_macros::dec;

    #[test]
    fn test_from_bucket() {
        let mut bucket = CostBucket::new(
            BucketKey::new("lkc-1", "KafkaBase", HOUR_MS),
            HOUR_MS,
            "USD",
            CostType::Shared,
        );
        bucket.accumulate(dec!(2.5), dec!(10));

        let sample = MetricSample::from_bucket("chargeback", &bucket);

        assert_eq!(sample.name, "chargeback_bucket_cost");
        assert_eq!(sample.value, 2.5);
        assert_eq!(sample.timestamp_ms, HOUR_MS);
        assert_eq!(sample.label("resource_id"), Some("lkc-1"));
        assert_eq!(sample.label("sku"), Some("KafkaBase"));
        assert_eq!(sample.label("cost_type"), Some("shared"));
        assert_eq!(sample.label("currency"), Some("USD"));
        assert_eq!(sample.labels.len(), LABEL_NAMES.len());
    }
}
