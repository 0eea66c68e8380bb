//! Backfill coordinator
//!
//! Runs on its own cadence. Each cycle takes the aged sealed buckets from the
//! latest snapshot, commits them block by block and reports the outcome back
//! to the scheduler, which owns the cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chargeback_common::{BackfillError, BucketKey, CostBucket, TimeRange};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::job::{BackfillJob, BlockPlan};
use super::store::{BlockStore, CommitMode, CommitOutcome, RenderedBlock};
use crate::aggregation::BucketSnapshot;
use crate::exporter::ExporterMetrics;
use crate::scheduler::ReadinessReader;
use crate::snapshot::SnapshotReader;

/// Per-block result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    Committed,
    /// Identical block already durable
    AlreadyPresent,
    /// Conflicting block recomputed and replaced
    Replaced,
    /// Failed; retried next cadence
    Retryable(String),
    /// Failed too many cadences; buckets released
    Abandoned(String),
}

impl BlockOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockOutcome::Committed => "committed",
            BlockOutcome::AlreadyPresent => "already_present",
            BlockOutcome::Replaced => "replaced",
            BlockOutcome::Retryable(_) => "retryable",
            BlockOutcome::Abandoned(_) => "abandoned",
        }
    }

    /// The block's buckets are durable in the store
    pub fn is_durable(&self) -> bool {
        matches!(
            self,
            BlockOutcome::Committed | BlockOutcome::AlreadyPresent | BlockOutcome::Replaced
        )
    }
}

#[derive(Debug, Clone)]
pub struct BlockResult {
    pub range: TimeRange,
    pub keys: Vec<BucketKey>,
    pub outcome: BlockOutcome,
}

/// Outcome of one submitted job, sent to the scheduler
#[derive(Debug, Clone)]
pub struct BackfillReport {
    pub job_id: Uuid,
    pub results: Vec<BlockResult>,
}

impl BackfillReport {
    pub fn durable_keys(&self) -> impl Iterator<Item = &BucketKey> {
        self.results
            .iter()
            .filter(|r| r.outcome.is_durable())
            .flat_map(|r| r.keys.iter())
    }

    pub fn abandoned_keys(&self) -> impl Iterator<Item = &BucketKey> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, BlockOutcome::Abandoned(_)))
            .flat_map(|r| r.keys.iter())
    }

    pub fn count(&self, outcome: &str) -> usize {
        self.results.iter().filter(|r| r.outcome.as_str() == outcome).count()
    }
}

pub struct BackfillCoordinator {
    store: Arc<dyn BlockStore>,
    snapshots: SnapshotReader,
    readiness: ReadinessReader,
    reports: mpsc::Sender<BackfillReport>,
    prefix: String,
    block_duration_ms: i64,
    interval: Duration,
    max_attempts: u32,
    /// Failed cadences per block range
    attempts: BTreeMap<TimeRange, u32>,
    metrics: Option<ExporterMetrics>,
}

impl BackfillCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BlockStore>,
        snapshots: SnapshotReader,
        readiness: ReadinessReader,
        reports: mpsc::Sender<BackfillReport>,
        prefix: impl Into<String>,
        block_duration_ms: i64,
        interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            snapshots,
            readiness,
            reports,
            prefix: prefix.into(),
            block_duration_ms,
            interval,
            max_attempts: max_attempts.max(1),
            attempts: BTreeMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ExporterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run until cancelled; an in-flight block commit always completes
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "Backfill coordinator started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_once(&cancel).await;
                }
            }
        }

        info!("Backfill coordinator stopped");
    }

    /// One cadence: probe, submit pending buckets, report
    pub async fn run_once(&mut self, cancel: &CancellationToken) -> Option<BackfillReport> {
        let readiness = self.readiness.get();
        if !readiness.is_ready() {
            debug!(%readiness, "Skipping backfill cycle");
            return None;
        }

        let snapshot = self.snapshots.current();
        let job = BackfillJob::from_buckets(snapshot.pending_backfill.clone(), self.block_duration_ms)?;

        if let Err(e) = self.store.probe().await {
            warn!(error = %e, "Store unavailable, backfill retried next cadence");
            if let Some(metrics) = &self.metrics {
                metrics.record_block("store_unavailable");
            }
            return None;
        }

        let report = self.submit(&job, cancel).await;
        if self.reports.send(report.clone()).await.is_err() {
            warn!(job_id = %report.job_id, "Scheduler gone, dropping backfill report");
        }
        Some(report)
    }

    /// Commit every block of `job`, independently of each other
    #[instrument(skip(self, job, cancel), fields(job_id = %job.id, range = %job.range))]
    pub async fn submit(&mut self, job: &BackfillJob, cancel: &CancellationToken) -> BackfillReport {
        let mut results = Vec::new();

        for plan in job.split() {
            if cancel.is_cancelled() {
                info!("Cancelled, leaving remaining blocks for the next run");
                break;
            }
            let result = self.commit_plan(plan).await;
            if let Some(metrics) = &self.metrics {
                metrics.record_block(result.outcome.as_str());
            }
            results.push(result);
        }

        let report = BackfillReport {
            job_id: job.id,
            results,
        };
        info!(
            blocks = report.results.len(),
            committed = report.count("committed"),
            already_present = report.count("already_present"),
            replaced = report.count("replaced"),
            retryable = report.count("retryable"),
            abandoned = report.count("abandoned"),
            "Backfill job finished"
        );
        report
    }

    async fn commit_plan(&mut self, plan: BlockPlan) -> BlockResult {
        let block = RenderedBlock::render(&plan, &self.prefix);

        let committed = match self.store.commit(&block, CommitMode::Create).await {
            Ok(CommitOutcome::Committed(_)) => Ok((BlockOutcome::Committed, plan.keys())),
            Ok(CommitOutcome::AlreadyPresent(_)) => Ok((BlockOutcome::AlreadyPresent, plan.keys())),
            Err(BackfillError::BlockConflict { existing_digest, .. }) => {
                warn!(
                    range = %plan.range,
                    existing = %existing_digest,
                    digest = %block.digest,
                    "Block conflict, recomputing from latest snapshot"
                );
                self.replace(&plan).await
            }
            Err(e) => Err(e),
        };

        match committed {
            Ok((outcome, keys)) => {
                self.attempts.remove(&plan.range);
                BlockResult {
                    range: plan.range,
                    keys,
                    outcome,
                }
            }
            Err(e) => self.failed(plan, e),
        }
    }

    /// Rebuild a conflicting block and commit it in replace mode
    async fn replace(&self, plan: &BlockPlan) -> Result<(BlockOutcome, Vec<BucketKey>), BackfillError> {
        let latest = self.snapshots.current();
        let existing = self.store.manifest(&plan.range).await?;
        let recomputed = recompute(plan, existing.map(|m| m.buckets).unwrap_or_default(), &latest);

        let block = RenderedBlock::render(&recomputed, &self.prefix);
        match self.store.commit(&block, CommitMode::Replace).await? {
            CommitOutcome::Committed(_) => Ok((BlockOutcome::Replaced, recomputed.keys())),
            CommitOutcome::AlreadyPresent(_) => Ok((BlockOutcome::AlreadyPresent, recomputed.keys())),
        }
    }

    fn failed(&mut self, plan: BlockPlan, e: BackfillError) -> BlockResult {
        let attempts = self.attempts.entry(plan.range).or_insert(0);
        *attempts += 1;

        let outcome = if e.is_permanent() {
            error!(
                range = %plan.range,
                buckets = plan.buckets.len(),
                error = %e,
                "Backfill block cannot be committed, abandoning"
            );
            self.attempts.remove(&plan.range);
            BlockOutcome::Abandoned(e.to_string())
        } else if *attempts >= self.max_attempts {
            error!(
                range = %plan.range,
                attempts = *attempts,
                buckets = plan.buckets.len(),
                error = %e,
                "Abandoning backfill block"
            );
            self.attempts.remove(&plan.range);
            BlockOutcome::Abandoned(e.to_string())
        } else {
            warn!(range = %plan.range, attempts = *attempts, error = %e, "Backfill block failed, will retry");
            BlockOutcome::Retryable(e.to_string())
        };

        BlockResult {
            range: plan.range,
            keys: plan.keys(),
            outcome,
        }
    }
}

/// Block content rebuilt from durable buckets, overlaid by the plan, overlaid
/// by the latest snapshot's source buckets for the same range
fn recompute(plan: &BlockPlan, durable: Vec<CostBucket>, latest: &BucketSnapshot) -> BlockPlan {
    let mut merged: BTreeMap<BucketKey, CostBucket> = BTreeMap::new();
    let in_range = |b: &CostBucket| plan.range.contains(b.key.bucket_start);

    for bucket in durable.into_iter().filter(|b| in_range(b)) {
        merged.insert(bucket.key.clone(), bucket);
    }
    for bucket in plan.buckets.iter().chain(latest.pending_backfill.iter()) {
        if in_range(bucket) && bucket.sealed {
            merged.insert(bucket.key.clone(), bucket.clone());
        }
    }

    BlockPlan {
        range: plan.range,
        buckets: merged.into_values().collect(),
    }
}
