//! Polling driver
//!
//! Sequences fetch, aggregation, cache refresh, readiness and snapshot
//! publication. The driver is the only writer of the cache, the snapshot
//! and the readiness cell.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chargeback_common::{align_down, align_up, BillingError, BucketKey, ReadinessState, TimeRange};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::state::{CyclePhase, ReadinessWriter};
use crate::aggregation::{BucketCache, CostAggregator, MergeStats};
use crate::backfill::BackfillReport;
use crate::billing::BillingSource;
use crate::config::ExporterConfig;
use crate::exporter::ExporterMetrics;
use crate::snapshot::SnapshotPublisher;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub interval: Duration,
    pub initial_lookback_ms: i64,
    /// History re-fetched every `settle_interval_ms` for late billing lines
    pub settle_lookback_ms: i64,
    pub settle_interval_ms: i64,
    pub live_horizon_ms: i64,
    pub seal_delay_ms: i64,
    pub bucket_width_ms: i64,
    pub shutdown_grace: Duration,
    /// When false, aged buckets are released without a backfill
    pub backfill_enabled: bool,
}

impl SchedulerOptions {
    pub fn from_config(config: &ExporterConfig) -> Self {
        Self {
            interval: config.scheduler.interval(),
            initial_lookback_ms: config.scheduler.initial_lookback_ms(),
            settle_lookback_ms: config.scheduler.settle_lookback_ms(),
            settle_interval_ms: config.scheduler.settle_interval_ms(),
            live_horizon_ms: config.aggregation.live_horizon_ms(),
            seal_delay_ms: config.aggregation.seal_delay_ms(),
            bucket_width_ms: config.aggregation.bucket_width_ms(),
            shutdown_grace: config.scheduler.shutdown_grace(),
            backfill_enabled: config.backfill.enabled,
        }
    }
}

#[derive(Debug)]
pub enum CycleOutcome {
    Success,
    Failed(BillingError),
    /// Polling stopped after a credential failure
    Halted,
}

#[derive(Debug)]
pub struct CycleReport {
    pub window: Option<TimeRange>,
    pub outcome: CycleOutcome,
    pub records: usize,
    pub skipped: usize,
    pub merge: MergeStats,
    pub readiness: ReadinessState,
    pub generation: u64,
}

pub struct Scheduler {
    source: Arc<dyn BillingSource>,
    aggregator: CostAggregator,
    cache: BucketCache,
    options: SchedulerOptions,
    readiness: ReadinessWriter,
    publisher: SnapshotPublisher,
    reports: mpsc::Receiver<BackfillReport>,
    metrics: Option<ExporterMetrics>,
    phase: CyclePhase,
    /// Newest timestamp already held by the store
    history_floor: Option<i64>,
    initial_fetch_done: bool,
    /// Start time of the last successful long fetch
    last_settle_at: Option<i64>,
    halted: bool,
}

impl Scheduler {
    pub fn new(
        source: Arc<dyn BillingSource>,
        aggregator: CostAggregator,
        options: SchedulerOptions,
        readiness: ReadinessWriter,
        publisher: SnapshotPublisher,
        reports: mpsc::Receiver<BackfillReport>,
    ) -> Self {
        let cache = BucketCache::new(options.live_horizon_ms, options.seal_delay_ms);
        Self {
            source,
            aggregator,
            cache,
            options,
            readiness,
            publisher,
            reports,
            metrics: None,
            phase: CyclePhase::Starting,
            history_floor: None,
            initial_fetch_done: false,
            last_settle_at: None,
            halted: false,
        }
    }

    pub fn with_metrics(mut self, metrics: ExporterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start the initial fetch no earlier than `floor` (Unix millis)
    pub fn with_history_floor(mut self, floor: Option<i64>) -> Self {
        self.history_floor = floor;
        self
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn cache(&self) -> &BucketCache {
        &self.cache
    }

    /// Poll on the configured interval until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.options.interval.as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let grace = self.options.shutdown_grace;
                    let cycle = self.run_cycle();
                    tokio::pin!(cycle);

                    tokio::select! {
                        _ = &mut cycle => {}
                        _ = cancel.cancelled() => {
                            info!(grace_secs = grace.as_secs(), "Shutdown requested during cycle");
                            if tokio::time::timeout(grace, &mut cycle).await.is_err() {
                                warn!("In-flight cycle aborted after shutdown grace");
                            }
                            break;
                        }
                    }
                }
                Some(report) = self.reports.recv() => {
                    self.apply_report(report);
                    self.publish(Utc::now().timestamp_millis());
                }
            }
        }

        info!("Scheduler stopped");
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        self.run_cycle_at(Utc::now().timestamp_millis()).await
    }

    /// One polling cycle as of `now` (Unix millis)
    #[instrument(skip(self))]
    pub async fn run_cycle_at(&mut self, now: i64) -> CycleReport {
        let started = Instant::now();
        while let Ok(report) = self.reports.try_recv() {
            self.apply_report(report);
        }

        if self.halted {
            debug!("Polling halted after credential failure");
            let generation = self.publish(now);
            return CycleReport {
                window: None,
                outcome: CycleOutcome::Halted,
                records: 0,
                skipped: 0,
                merge: MergeStats::default(),
                readiness: self.readiness.get(),
                generation,
            };
        }

        let window = self.fetch_window(now);
        let settling = !self.initial_fetch_done || self.settle_due(now);
        self.set_phase(CyclePhase::Fetching);
        let fetched = self.source.fetch(&window).await;

        let (outcome, records, skipped, merge) = match fetched {
            Ok(records) => {
                self.set_phase(CyclePhase::Aggregating);
                let aggregated = self.aggregator.aggregate(&records, now);
                let merge = self.cache.merge(aggregated.buckets);
                self.cache.forget_durable_before(self.tombstone_floor(now));
                self.initial_fetch_done = true;
                if settling {
                    self.last_settle_at = Some(now);
                }

                self.set_readiness(ReadinessState::Ready);
                self.set_phase(CyclePhase::Serving);
                if let Some(metrics) = &self.metrics {
                    metrics.record_fetch("success");
                    metrics.records_skipped_total.inc_by(aggregated.skipped as u64);
                    metrics.late_revisions_total.inc_by(merge.late_revisions as u64);
                    metrics.last_success_timestamp_seconds.set(now.div_euclid(1000));
                }
                info!(
                    window = %window,
                    settling,
                    records = records.len(),
                    skipped = aggregated.skipped,
                    duplicates = aggregated.duplicates,
                    inserted = merge.inserted,
                    replaced = merge.replaced,
                    late_revisions = merge.late_revisions,
                    "Polling cycle succeeded"
                );
                (CycleOutcome::Success, records.len(), aggregated.skipped, merge)
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_fetch(e.kind());
                }
                if e.is_auth() {
                    self.halted = true;
                    error!(error = %e, "Billing credentials rejected, polling stopped");
                } else {
                    warn!(window = %window, error = %e, "Polling cycle failed");
                }
                self.set_readiness(ReadinessState::Degraded);
                self.set_phase(CyclePhase::Degraded);
                (CycleOutcome::Failed(e), 0, 0, MergeStats::default())
            }
        };

        if !self.options.backfill_enabled {
            let aged: Vec<BucketKey> = self.cache.aged(now).into_iter().map(|b| b.key).collect();
            if !aged.is_empty() {
                debug!(buckets = aged.len(), "Releasing aged buckets, backfill disabled");
                self.cache.abandon(&aged);
            }
        }

        let generation = self.publish(now);
        if let Some(metrics) = &self.metrics {
            metrics.cycle_duration_seconds.observe(started.elapsed().as_secs_f64());
        }

        CycleReport {
            window: Some(window),
            outcome,
            records,
            skipped,
            merge,
            readiness: self.readiness.get(),
            generation,
        }
    }

    /// Window for the next fetch, aligned to the bucket width
    ///
    /// The first fetch covers the initial lookback, starting no later than
    /// the live range before the history floor. Later fetches cover the live
    /// range, widened to the settlement lookback once per settle interval.
    pub fn fetch_window(&self, now: i64) -> TimeRange {
        let width = self.options.bucket_width_ms;
        let end = align_up(now, width).max(align_down(now, width) + width);
        let live = self.live_range_ms();

        let start = if !self.initial_fetch_done {
            let lookback = now - self.options.initial_lookback_ms;
            match self.history_floor {
                // step back over buckets still pending backfill at the last shutdown
                Some(floor) => lookback.max(floor - live),
                None => lookback,
            }
        } else if self.settle_due(now) {
            now - self.options.settle_lookback_ms.max(live)
        } else {
            now - live
        };

        let start = align_down(start, width).min(end - width);
        TimeRange { start, end }
    }

    fn live_range_ms(&self) -> i64 {
        self.options.live_horizon_ms + self.options.seal_delay_ms + self.options.bucket_width_ms
    }

    fn settle_due(&self, now: i64) -> bool {
        self.last_settle_at
            .map_or(true, |at| now - at >= self.options.settle_interval_ms)
    }

    /// Tombstones older than every window still re-fetched can go
    fn tombstone_floor(&self, now: i64) -> i64 {
        align_down(
            now - self.options.settle_lookback_ms.max(self.live_range_ms()),
            self.options.bucket_width_ms,
        )
    }

    fn apply_report(&mut self, report: BackfillReport) {
        let confirmed = self.cache.confirm_durable(report.durable_keys());
        let abandoned = self.cache.abandon(report.abandoned_keys());
        debug!(job_id = %report.job_id, confirmed, abandoned, "Applied backfill report");
    }

    fn publish(&mut self, now: i64) -> u64 {
        let snapshot = self.cache.snapshot(now);
        let generation = snapshot.generation;
        if let Some(metrics) = &self.metrics {
            metrics.cached_buckets.set(self.cache.len() as i64);
        }
        self.publisher.publish(snapshot);
        generation
    }

    fn set_readiness(&self, state: ReadinessState) {
        let previous = self.readiness.set(state);
        if previous != state {
            info!(from = %previous, to = %state, "Readiness changed");
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_readiness(state);
        }
    }

    fn set_phase(&mut self, phase: CyclePhase) {
        debug!(from = %self.phase, to = %phase, "Scheduler phase");
        self.phase = phase;
    }
}
