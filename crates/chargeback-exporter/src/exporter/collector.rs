//! Snapshot to Prometheus metric families

use chargeback_common::{bucket_cost_metric, MetricSample};
use prometheus::proto::{Gauge, LabelPair, Metric, MetricFamily, MetricType};

use crate::aggregation::BucketSnapshot;

const BUCKET_COST_HELP: &str = "Cost accumulated per resource, SKU and time bucket";

/// Samples for the live buckets of `snapshot`, in key order
///
/// A timestamped sample is final: the store keeps the first value it ingests
/// per series and timestamp, so open buckets are withheld until sealed.
pub fn live_samples(prefix: &str, snapshot: &BucketSnapshot, with_timestamps: bool) -> Vec<MetricSample> {
    snapshot
        .live
        .iter()
        .filter(|bucket| bucket.sealed || !with_timestamps)
        .map(|bucket| MetricSample::from_bucket(prefix, bucket))
        .collect()
}

/// Build the bucket cost family; empty snapshots yield no family
pub fn bucket_families(prefix: &str, snapshot: &BucketSnapshot, with_timestamps: bool) -> Vec<MetricFamily> {
    let samples = live_samples(prefix, snapshot, with_timestamps);
    if samples.is_empty() {
        return Vec::new();
    }

    let mut family = MetricFamily::default();
    family.set_name(bucket_cost_metric(prefix));
    family.set_help(BUCKET_COST_HELP.to_string());
    family.set_field_type(MetricType::GAUGE);

    for sample in samples {
        family.mut_metric().push(to_metric(sample, with_timestamps));
    }
    vec![family]
}

fn to_metric(sample: MetricSample, with_timestamps: bool) -> Metric {
    let mut metric = Metric::default();
    for (name, value) in sample.labels {
        let mut pair = LabelPair::default();
        pair.set_name(name);
        pair.set_value(value);
        metric.mut_label().push(pair);
    }

    let mut gauge = Gauge::default();
    gauge.set_value(sample.value);
    metric.set_gauge(gauge);

    if with_timestamps {
        metric.set_timestamp_ms(sample.timestamp_ms);
    }
    metric
}

#[cfg(test)]
mod tests {
    use super::*;
    use chargeback_common::{BucketKey, CostBucket, CostType, HOUR_MS};
    use prometheus::{Encoder, TextEncoder};
    use rust_decimal_macros::dec;

    fn snapshot() -> BucketSnapshot {
        let mut bucket = CostBucket::new(BucketKey::new("lkc-1", "KAFKA", HOUR_MS), HOUR_MS, "USD", CostType::Usage);
        bucket.accumulate(dec!(2.5), dec!(10));
        bucket.sealed = true;
        BucketSnapshot {
            generation: 1,
            taken_at: 2 * HOUR_MS,
            live: vec![bucket],
            pending_backfill: Vec::new(),
        }
    }

    fn encode(families: &[MetricFamily]) -> String {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_timestamped_exposition() {
        let text = encode(&bucket_families("chargeback", &snapshot(), true));

        assert!(text.contains("# TYPE chargeback_bucket_cost gauge"));
        assert!(text.contains(
            "chargeback_bucket_cost{resource_id=\"lkc-1\",sku=\"KAFKA\",cost_type=\"usage\",currency=\"USD\"} 2.5 3600000"
        ));
    }

    #[test]
    fn test_untimestamped_exposition() {
        let text = encode(&bucket_families("chargeback", &snapshot(), false));
        assert!(text.contains("currency=\"USD\"} 2.5\n"));
    }

    #[test]
    fn test_open_bucket_withheld_when_timestamped() {
        let mut open = CostBucket::new(BucketKey::new("lkc-2", "KAFKA", 2 * HOUR_MS), HOUR_MS, "USD", CostType::Usage);
        open.accumulate(dec!(1), dec!(4));
        let mut snapshot = snapshot();
        snapshot.live.push(open);

        let timestamped = encode(&bucket_families("chargeback", &snapshot, true));
        assert!(timestamped.contains("resource_id=\"lkc-1\""));
        assert!(!timestamped.contains("resource_id=\"lkc-2\""));

        let untimestamped = encode(&bucket_families("chargeback", &snapshot, false));
        assert!(untimestamped.contains("resource_id=\"lkc-2\""));

        snapshot.live.remove(0);
        assert!(bucket_families("chargeback", &snapshot, true).is_empty());
    }

    #[test]
    fn test_empty_snapshot_has_no_family() {
        assert!(bucket_families("chargeback", &BucketSnapshot::default(), true).is_empty());
    }
}
