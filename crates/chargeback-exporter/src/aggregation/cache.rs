//! Rolling cache of computed buckets
//!
//! Owned by the scheduler. Sealed entries are immutable; aged entries wait
//! here until the backfill path confirms or abandons them.

use std::collections::{BTreeMap, BTreeSet};

use chargeback_common::{BucketKey, CostBucket};
use tracing::{debug, warn};

/// Counters from one merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
    /// Recomputations of sealed buckets that differ from the cached value
    pub late_revisions: usize,
    /// Buckets already handed off to the store
    pub already_durable: usize,
}

/// Immutable view published to the exporter and the backfill coordinator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub generation: u64,
    /// Unix millis at which the snapshot was built
    pub taken_at: i64,
    /// Buckets inside the live horizon, sorted by key
    pub live: Vec<CostBucket>,
    /// Sealed buckets past the live horizon, sorted by key
    pub pending_backfill: Vec<CostBucket>,
}

impl BucketSnapshot {
    /// Look up a bucket pending backfill
    pub fn pending(&self, key: &BucketKey) -> Option<&CostBucket> {
        self.pending_backfill
            .binary_search_by(|b| b.key.cmp(key))
            .ok()
            .map(|i| &self.pending_backfill[i])
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty() && self.pending_backfill.is_empty()
    }
}

pub struct BucketCache {
    live_horizon_ms: i64,
    seal_delay_ms: i64,
    entries: BTreeMap<BucketKey, CostBucket>,
    /// Keys handed off to the store, kept so re-fetches do not resurrect them
    durable: BTreeSet<BucketKey>,
    generation: u64,
}

impl BucketCache {
    pub fn new(live_horizon_ms: i64, seal_delay_ms: i64) -> Self {
        Self {
            live_horizon_ms,
            seal_delay_ms,
            entries: BTreeMap::new(),
            durable: BTreeSet::new(),
            generation: 0,
        }
    }

    /// Merge one aggregation run
    pub fn merge(&mut self, buckets: Vec<CostBucket>) -> MergeStats {
        let mut stats = MergeStats::default();

        for bucket in buckets {
            if self.durable.contains(&bucket.key) {
                stats.already_durable += 1;
                continue;
            }

            match self.entries.get_mut(&bucket.key) {
                None => {
                    self.entries.insert(bucket.key.clone(), bucket);
                    stats.inserted += 1;
                }
                Some(existing) if existing.sealed => {
                    if existing.same_value(&bucket) {
                        stats.unchanged += 1;
                    } else {
                        stats.late_revisions += 1;
                        warn!(
                            resource_id = %bucket.key.resource_id,
                            sku = %bucket.key.sku,
                            bucket_start = bucket.key.bucket_start,
                            cached = %existing.cost,
                            revised = %bucket.cost,
                            "Ignoring late revision of sealed bucket"
                        );
                    }
                }
                Some(existing) => {
                    if *existing == bucket {
                        stats.unchanged += 1;
                    } else {
                        *existing = bucket;
                        stats.replaced += 1;
                    }
                }
            }
        }

        debug!(
            inserted = stats.inserted,
            replaced = stats.replaced,
            unchanged = stats.unchanged,
            late_revisions = stats.late_revisions,
            "Merged buckets into cache"
        );
        stats
    }

    /// Seal every entry whose window has closed
    pub fn seal(&mut self, now: i64) {
        for bucket in self.entries.values_mut() {
            bucket.seal_if_closed(now, self.seal_delay_ms);
        }
    }

    fn is_aged(&self, bucket: &CostBucket, now: i64) -> bool {
        bucket.sealed && bucket.window.end <= now - self.live_horizon_ms
    }

    /// Sealed buckets whose end is older than the live horizon
    pub fn aged(&self, now: i64) -> Vec<CostBucket> {
        self.entries
            .values()
            .filter(|b| self.is_aged(b, now))
            .cloned()
            .collect()
    }

    /// Drop keys the store now holds durably
    pub fn confirm_durable<'a>(&mut self, keys: impl IntoIterator<Item = &'a BucketKey>) -> usize {
        self.release(keys)
    }

    /// Drop keys whose backfill was given up
    pub fn abandon<'a>(&mut self, keys: impl IntoIterator<Item = &'a BucketKey>) -> usize {
        self.release(keys)
    }

    fn release<'a>(&mut self, keys: impl IntoIterator<Item = &'a BucketKey>) -> usize {
        let mut released = 0;
        for key in keys {
            if self.entries.remove(key).is_some() {
                released += 1;
            }
            self.durable.insert(key.clone());
        }
        released
    }

    /// Forget tombstones that precede any window still being fetched
    pub fn forget_durable_before(&mut self, ts: i64) {
        self.durable.retain(|key| key.bucket_start >= ts);
    }

    /// Reseal and build a new snapshot
    pub fn snapshot(&mut self, now: i64) -> BucketSnapshot {
        self.seal(now);
        self.generation += 1;

        let (pending_backfill, live): (Vec<CostBucket>, Vec<CostBucket>) = self
            .entries
            .values()
            .cloned()
            .partition(|b| self.is_aged(b, now));

        BucketSnapshot {
            generation: self.generation,
            taken_at: now,
            live,
            pending_backfill,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &BucketKey) -> Option<&CostBucket> {
        self.entries.get(key)
    }
}
