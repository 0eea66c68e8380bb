//! Cost aggregation into fixed-width buckets
//!
//! Records are deduplicated by identity, then each record is spread over the
//! buckets its window touches in proportion to time overlap.

use std::collections::{btree_map::Entry, BTreeMap, BTreeSet};

use chargeback_common::{BucketKey, CostBucket, CostType, TimeRange, UsageRecord};
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use crate::config::AggregationSettings;

/// Bucketing rules
#[derive(Debug, Clone)]
pub struct AggregationRules {
    pub bucket_width_ms: i64,
    pub seal_delay_ms: i64,
    /// SKUs (or SKU products) accounted as shared cost
    pub shared_skus: BTreeSet<String>,
}

impl AggregationRules {
    pub fn from_settings(settings: &AggregationSettings) -> Self {
        Self {
            bucket_width_ms: settings.bucket_width_ms(),
            seal_delay_ms: settings.seal_delay_ms(),
            shared_skus: settings.shared_skus.clone(),
        }
    }

    pub fn cost_type(&self, sku: &str) -> CostType {
        let product = sku.split(':').next().unwrap_or(sku);
        if self.shared_skus.contains(sku) || self.shared_skus.contains(product) {
            CostType::Shared
        } else {
            CostType::Usage
        }
    }
}

/// Result of one aggregation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationOutcome {
    /// Buckets sorted by key
    pub buckets: Vec<CostBucket>,
    /// Records rejected by validation or currency mismatch
    pub skipped: usize,
    /// Records dropped as duplicates of an earlier identity
    pub duplicates: usize,
}

/// Stateless bucket builder
#[derive(Debug, Clone)]
pub struct CostAggregator {
    rules: AggregationRules,
}

impl CostAggregator {
    pub fn new(rules: AggregationRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &AggregationRules {
        &self.rules
    }

    /// Aggregate `records` as of `now`
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub fn aggregate(&self, records: &[UsageRecord], now: i64) -> AggregationOutcome {
        let mut unique: BTreeMap<String, &UsageRecord> = BTreeMap::new();
        let mut duplicates = 0;
        for record in records {
            match unique.entry(record.identity()) {
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
                Entry::Occupied(_) => duplicates += 1,
            }
        }

        let mut buckets: BTreeMap<BucketKey, CostBucket> = BTreeMap::new();
        let mut skipped = 0;
        for (identity, record) in unique {
            if let Err(e) = record.validate() {
                skipped += 1;
                warn!(record = %identity, error = %e, "Skipping invalid usage record");
                continue;
            }
            if !self.fold_record(&mut buckets, record) {
                skipped += 1;
                warn!(
                    record = %identity,
                    resource_id = %record.resource_id,
                    sku = %record.sku,
                    currency = %record.currency,
                    "Skipping usage record with mismatched currency"
                );
            }
        }

        let buckets: Vec<CostBucket> = buckets
            .into_values()
            .map(|mut bucket| {
                bucket.seal_if_closed(now, self.rules.seal_delay_ms);
                bucket
            })
            .collect();

        debug!(buckets = buckets.len(), skipped, duplicates, "Aggregated usage records");

        AggregationOutcome {
            buckets,
            skipped,
            duplicates,
        }
    }

    /// Fold one record into the bucket map; false on currency mismatch
    fn fold_record(&self, buckets: &mut BTreeMap<BucketKey, CostBucket>, record: &UsageRecord) -> bool {
        let width = self.rules.bucket_width_ms;
        let slices = split_record(record, width);

        let conflicting = slices.iter().any(|(slot, _, _)| {
            buckets
                .get(&BucketKey::new(&record.resource_id, &record.sku, slot.start))
                .is_some_and(|b| b.currency != record.currency)
        });
        if conflicting {
            return false;
        }

        let cost_type = self.rules.cost_type(&record.sku);
        for (slot, cost, quantity) in slices {
            let key = BucketKey::new(&record.resource_id, &record.sku, slot.start);
            buckets
                .entry(key.clone())
                .or_insert_with(|| CostBucket::new(key, width, &record.currency, cost_type))
                .accumulate(cost, quantity);
        }
        true
    }
}

/// Split a record's cost and quantity over the slots its window touches
///
/// Slices are proportional to overlap; the last slice takes the remainder so
/// the parts sum exactly to the whole.
pub fn split_record(record: &UsageRecord, width_ms: i64) -> Vec<(TimeRange, Decimal, Decimal)> {
    let total_cost = record.cost();
    let total_quantity = record.quantity;
    let duration = Decimal::from(record.window.duration_ms());

    let slots: Vec<(TimeRange, i64)> = record
        .window
        .slots(width_ms)
        .into_iter()
        .filter_map(|slot| slot.overlap(&record.window).map(|o| (slot, o.duration_ms())))
        .collect();

    let mut slices = Vec::with_capacity(slots.len());
    let mut cost_left = total_cost;
    let mut quantity_left = total_quantity;
    let last = slots.len().saturating_sub(1);

    for (i, (slot, overlap_ms)) in slots.into_iter().enumerate() {
        if i == last {
            slices.push((slot, cost_left, quantity_left));
            break;
        }
        let overlap = Decimal::from(overlap_ms);
        let cost = total_cost * overlap / duration;
        let quantity = total_quantity * overlap / duration;
        cost_left -= cost;
        quantity_left -= quantity;
        slices.push((slot, cost, quantity));
    }
    slices
}
