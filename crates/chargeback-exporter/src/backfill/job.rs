//! Backfill jobs and their per-block plans

use std::collections::BTreeMap;

use chargeback_common::{align_down, BucketKey, CostBucket, TimeRange};
use uuid::Uuid;

/// Sealed buckets to load into the store, split at block boundaries
#[derive(Debug, Clone)]
pub struct BackfillJob {
    pub id: Uuid,
    /// Smallest block-aligned range covering every bucket
    pub range: TimeRange,
    pub buckets: Vec<CostBucket>,
    pub block_duration_ms: i64,
}

/// One store block worth of samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPlan {
    pub range: TimeRange,
    /// Buckets starting inside `range`, sorted by key
    pub buckets: Vec<CostBucket>,
}

impl BlockPlan {
    pub fn keys(&self) -> Vec<BucketKey> {
        self.buckets.iter().map(|b| b.key.clone()).collect()
    }
}

impl BackfillJob {
    /// Build a job from sealed buckets; `None` when nothing is sealed
    pub fn from_buckets(buckets: Vec<CostBucket>, block_duration_ms: i64) -> Option<Self> {
        let buckets: Vec<CostBucket> = buckets.into_iter().filter(|b| b.sealed).collect();
        let start = buckets.iter().map(|b| b.key.bucket_start).min()?;
        let end = buckets.iter().map(|b| b.window.end).max()?;
        let range = TimeRange { start, end }.aligned(block_duration_ms);

        Some(Self {
            id: Uuid::now_v7(),
            range,
            buckets,
            block_duration_ms,
        })
    }

    /// Block boundary a bucket belongs to
    pub fn target_boundary(&self, bucket: &CostBucket) -> i64 {
        align_down(bucket.key.bucket_start, self.block_duration_ms)
    }

    /// Per-block plans in time order; blocks without buckets are omitted
    pub fn split(&self) -> Vec<BlockPlan> {
        let mut blocks: BTreeMap<i64, Vec<CostBucket>> = BTreeMap::new();
        for bucket in &self.buckets {
            blocks
                .entry(self.target_boundary(bucket))
                .or_default()
                .push(bucket.clone());
        }

        blocks
            .into_iter()
            .map(|(start, mut buckets)| {
                buckets.sort_by(|a, b| a.key.cmp(&b.key));
                BlockPlan {
                    range: TimeRange {
                        start,
                        end: start + self.block_duration_ms,
                    },
                    buckets,
                }
            })
            .collect()
    }
}
