//! Integration tests for the chargeback exporter
//!
//! Covers the full pipeline:
//! - billing API → aggregation → `/metrics`
//! - readiness transitions on the health port
//! - scrapes during an in-flight polling cycle
//! - backfill block commits against a real data directory

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chargeback_common::{BackfillError, BillingError, ReadinessState, TimeRange, UsageRecord, HOUR_MS};
use chargeback_exporter::aggregation::{AggregationRules, CostAggregator};
use chargeback_exporter::backfill::{BackfillReport, BlockStore, CommitMode, CommitOutcome, RenderedBlock};
use chargeback_exporter::billing::BillingSource;
use chargeback_exporter::exporter::{health_router, metrics_router, ExporterState};
use chargeback_exporter::scheduler::{readiness_channel, ReadinessReader, Scheduler, SchedulerOptions};
use chargeback_exporter::snapshot::{snapshot_channel, SnapshotReader};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use prometheus::Registry;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, Notify};
use tower::ServiceExt;

/// Billing source replaying scripted results
#[derive(Default)]
struct ScriptedSource {
    results: Mutex<Vec<Result<Vec<UsageRecord>, BillingError>>>,
}

impl ScriptedSource {
    fn new(results: Vec<Result<Vec<UsageRecord>, BillingError>>) -> Self {
        let mut results = results;
        results.reverse();
        Self {
            results: Mutex::new(results),
        }
    }
}

#[async_trait]
impl BillingSource for ScriptedSource {
    async fn fetch(&self, _window: &TimeRange) -> Result<Vec<UsageRecord>, BillingError> {
        self.results.lock().pop().unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Test harness wiring a scheduler to both routers
struct TestHarness {
    scheduler: Scheduler,
    snapshots: SnapshotReader,
    readiness: ReadinessReader,
    reports: mpsc::Sender<BackfillReport>,
}

impl TestHarness {
    fn new(source: Arc<dyn BillingSource>) -> Self {
        let (writer, readiness) = readiness_channel();
        let (publisher, snapshots) = snapshot_channel();
        let (tx, rx) = mpsc::channel(8);
        let options = SchedulerOptions {
            interval: Duration::from_secs(300),
            initial_lookback_ms: 24 * HOUR_MS,
            settle_lookback_ms: 24 * HOUR_MS,
            settle_interval_ms: HOUR_MS,
            live_horizon_ms: 2 * HOUR_MS,
            seal_delay_ms: 0,
            bucket_width_ms: HOUR_MS,
            shutdown_grace: Duration::from_secs(1),
            backfill_enabled: true,
        };
        let aggregator = CostAggregator::new(AggregationRules {
            bucket_width_ms: HOUR_MS,
            seal_delay_ms: 0,
            shared_skus: BTreeSet::new(),
        });

        Self {
            scheduler: Scheduler::new(source, aggregator, options, writer, publisher, rx),
            snapshots,
            readiness,
            reports: tx,
        }
    }

    fn state(&self) -> ExporterState {
        ExporterState {
            snapshots: self.snapshots.clone(),
            readiness: self.readiness.clone(),
            registry: Registry::new(),
            prefix: Arc::from("chargeback"),
            expose_timestamps: true,
        }
    }

    fn metrics(&self) -> Router {
        metrics_router(self.state(), Duration::from_secs(1))
    }

    fn health(&self) -> Router {
        health_router(self.state())
    }
}

async fn get(router: Router, uri: &str) -> (StatusCode, String) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

fn record(resource: &str, start: i64) -> UsageRecord {
    UsageRecord::new(
        resource,
        "x",
        dec!(10),
        dec!(0.25),
        TimeRange::new(start, start + HOUR_MS).unwrap(),
    )
}

fn bucket_cost_lines(body: &str) -> Vec<&str> {
    body.lines()
        .filter(|l| l.starts_with("chargeback_bucket_cost{"))
        .collect()
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use axum::extract::Query;
    use axum::routing;
    use axum::Json;
    use chargeback_exporter::billing::{client::COSTS_PATH, BillingClient, RetryPolicy};
    use chargeback_exporter::config::BillingSettings;
    use std::collections::HashMap;

    async fn fake_costs(Query(query): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
        assert!(query.contains_key("start_date"));
        Json(serde_json::json!({
            "data": [{
                "id": "line-1",
                "start_date": "1970-01-01T00:00:00Z",
                "end_date": "1970-01-01T01:00:00Z",
                "resource": { "id": "A" },
                "line_type": "x",
                "quantity": 10,
                "price": 0.25
            }],
            "metadata": { "next": null, "next_page_token": null }
        }))
    }

    /// Test: one usage record becomes one sample with the bucket's cost and labels
    #[tokio::test]
    async fn test_end_to_end_single_record() {
        let app = Router::new().route(COSTS_PATH, routing::get(fake_costs));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let settings = BillingSettings {
            url: format!("http://{addr}"),
            api_key: "key".into(),
            api_secret: "secret".into(),
            ..BillingSettings::default()
        };
        let client = BillingClient::new(&settings, "USD").unwrap().with_retry_policy(RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        });

        let mut harness = TestHarness::new(Arc::new(client));
        harness.scheduler.run_cycle_at(HOUR_MS).await;

        let (status, body) = get(harness.metrics(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);

        let lines = bucket_cost_lines(&body);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with(
            "chargeback_bucket_cost{resource_id=\"A\",sku=\"x\",cost_type=\"usage\",currency=\"USD\"} 2.5"
        ));
    }

    /// Test: a re-fetched overlapping window does not double count
    #[tokio::test]
    async fn test_repeated_cycles_are_idempotent() {
        let line = record("A", HOUR_MS).with_provider_id("line-1");
        let source = ScriptedSource::new(vec![Ok(vec![line.clone()]), Ok(vec![line.clone(), line])]);
        let mut harness = TestHarness::new(Arc::new(source));

        harness.scheduler.run_cycle_at(2 * HOUR_MS + 1).await;
        harness.scheduler.run_cycle_at(2 * HOUR_MS + 2).await;

        let (_, body) = get(harness.metrics(), "/metrics").await;
        let lines = bucket_cost_lines(&body);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("2.5 3600000"));
    }
}

#[cfg(test)]
mod readiness_tests {
    use super::*;

    /// Test: 503 after a retry-exhausted failure, 200 after one success
    #[tokio::test]
    async fn test_ready_after_recovery() {
        let source = ScriptedSource::new(vec![
            Err(BillingError::Transient("connection reset".into())),
            Ok(vec![record("A", 0)]),
        ]);
        let mut harness = TestHarness::new(Arc::new(source));

        let (status, body) = get(harness.health(), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "Starting");

        harness.scheduler.run_cycle_at(HOUR_MS).await;
        let (status, body) = get(harness.health(), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "Degraded");

        harness.scheduler.run_cycle_at(HOUR_MS).await;
        let (status, body) = get(harness.health(), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Ready");
        assert_eq!(harness.readiness.get(), ReadinessState::Ready);
    }

    /// Test: metrics keep being served while degraded
    #[tokio::test]
    async fn test_stale_metrics_served_while_degraded() {
        let source = ScriptedSource::new(vec![
            Ok(vec![record("A", 0)]),
            Err(BillingError::Transient("timeout".into())),
        ]);
        let mut harness = TestHarness::new(Arc::new(source));

        harness.scheduler.run_cycle_at(HOUR_MS).await;
        harness.scheduler.run_cycle_at(HOUR_MS).await;

        assert_eq!(harness.readiness.get(), ReadinessState::Degraded);
        let (status, body) = get(harness.metrics(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bucket_cost_lines(&body).len(), 1);
    }
}

#[cfg(test)]
mod scrape_tests {
    use super::*;

    /// Billing source that parks inside fetch until released
    struct BlockingSource {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl BillingSource for BlockingSource {
        async fn fetch(&self, _window: &TimeRange) -> Result<Vec<UsageRecord>, BillingError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(vec![record("B", 0)])
        }
    }

    /// Test: a scrape completes while a polling cycle is in flight
    #[tokio::test]
    async fn test_scrape_does_not_wait_for_cycle() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let source = BlockingSource {
            entered: entered.clone(),
            release: release.clone(),
        };
        let harness = TestHarness::new(Arc::new(source));
        let metrics = harness.metrics();
        let mut scheduler = harness.scheduler;

        let cycle = tokio::spawn(async move {
            scheduler.run_cycle_at(HOUR_MS).await;
            scheduler
        });
        entered.notified().await;

        let (status, body) = tokio::time::timeout(Duration::from_secs(2), get(metrics.clone(), "/metrics"))
            .await
            .expect("scrape blocked on the polling cycle");
        assert_eq!(status, StatusCode::OK);
        assert!(bucket_cost_lines(&body).is_empty());

        release.notify_one();
        cycle.await.unwrap();

        let (_, body) = get(metrics, "/metrics").await;
        assert_eq!(bucket_cost_lines(&body).len(), 1);
    }
}

#[cfg(test)]
mod backfill_tests {
    use super::*;
    use chargeback_exporter::backfill::{
        BackfillCoordinator, BlockManifest, BlockOutcome, BlockPlan, BlockSink, FsBlockStore,
    };
    use std::path::Path;
    use tokio_util::sync::CancellationToken;

    /// Filesystem store whose commits fail for one block start
    struct FlakyStore {
        inner: FsBlockStore,
        failing_start: Mutex<Option<i64>>,
    }

    #[async_trait]
    impl BlockStore for FlakyStore {
        async fn probe(&self) -> Result<(), BackfillError> {
            self.inner.probe().await
        }

        async fn manifest(&self, range: &TimeRange) -> Result<Option<BlockManifest>, BackfillError> {
            self.inner.manifest(range).await
        }

        async fn commit(&self, block: &RenderedBlock, mode: CommitMode) -> Result<CommitOutcome, BackfillError> {
            let failing = *self.failing_start.lock();
            if failing == Some(block.range.start) {
                return Err(BackfillError::StoreUnavailable("injected failure".into()));
            }
            self.inner.commit(block, mode).await
        }
    }

    fn manifest_exists(dir: &Path, start: i64, end: i64) -> bool {
        dir.join(format!("chargeback-backfill/{start}-{end}.json")).exists()
    }

    fn coordinator(harness: &TestHarness, store: Arc<dyn BlockStore>) -> BackfillCoordinator {
        BackfillCoordinator::new(
            store,
            harness.snapshots.clone(),
            harness.readiness.clone(),
            harness.reports.clone(),
            "chargeback",
            2 * HOUR_MS,
            Duration::from_secs(3600),
            3,
        )
    }

    /// Test: a two-block job with block 2 failing leaves block 1 committed
    #[tokio::test]
    async fn test_block_commits_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore {
            inner: FsBlockStore::new(dir.path(), None, BlockSink::Directory),
            failing_start: Mutex::new(Some(2 * HOUR_MS)),
        });

        let source = ScriptedSource::new(vec![Ok(vec![record("A", 0), record("A", 2 * HOUR_MS)])]);
        let mut harness = TestHarness::new(Arc::new(source));
        harness.scheduler.run_cycle_at(10 * HOUR_MS).await;
        assert_eq!(harness.snapshots.current().pending_backfill.len(), 2);

        let mut coordinator = coordinator(&harness, store.clone());
        let cancel = CancellationToken::new();

        let report = coordinator.run_once(&cancel).await.unwrap();
        assert_eq!(report.results[0].outcome, BlockOutcome::Committed);
        assert!(matches!(report.results[1].outcome, BlockOutcome::Retryable(_)));
        assert!(manifest_exists(dir.path(), 0, 2 * HOUR_MS));
        assert!(!manifest_exists(dir.path(), 2 * HOUR_MS, 4 * HOUR_MS));

        // the scheduler releases only the durable block
        harness.scheduler.run_cycle_at(10 * HOUR_MS).await;
        let pending = harness.snapshots.current().pending_backfill.clone();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key.bucket_start, 2 * HOUR_MS);

        // block 2 succeeds on the next cadence
        *store.failing_start.lock() = None;
        let report = coordinator.run_once(&cancel).await.unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].outcome, BlockOutcome::Committed);
        assert!(manifest_exists(dir.path(), 2 * HOUR_MS, 4 * HOUR_MS));

        harness.scheduler.run_cycle_at(10 * HOUR_MS).await;
        assert!(harness.snapshots.current().pending_backfill.is_empty());
    }

    /// Test: a conflicting block is recomputed and replaced
    #[tokio::test]
    async fn test_conflicting_block_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsBlockStore::new(dir.path(), None, BlockSink::Directory));

        // a stale block for the same range is already in the store
        let source = ScriptedSource::new(vec![Ok(vec![record("A", 0)])]);
        let mut harness = TestHarness::new(Arc::new(source));
        harness.scheduler.run_cycle_at(10 * HOUR_MS).await;

        let mut stale = harness.snapshots.current().pending_backfill[0].clone();
        stale.cost = dec!(99);
        let stale_block = RenderedBlock::render(
            &BlockPlan {
                range: TimeRange::new(0, 2 * HOUR_MS).unwrap(),
                buckets: vec![stale],
            },
            "chargeback",
        );
        store.commit(&stale_block, CommitMode::Create).await.unwrap();

        let mut coordinator = coordinator(&harness, store.clone());
        let report = coordinator.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.results[0].outcome, BlockOutcome::Replaced);

        let manifest = store
            .manifest(&TimeRange::new(0, 2 * HOUR_MS).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(manifest.digest, stale_block.digest);
        assert_eq!(manifest.buckets.len(), 1);
        assert_eq!(manifest.buckets[0].cost, dec!(2.5));

        let series = std::fs::read_to_string(dir.path().join("chargeback-backfill/blocks/0-7200000/series.om")).unwrap();
        assert!(series.contains("} 2.5 0"));
    }

    /// Test: the coordinator does nothing until the exporter is ready
    #[tokio::test]
    async fn test_backfill_waits_for_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsBlockStore::new(dir.path(), None, BlockSink::Directory));
        let harness = TestHarness::new(Arc::new(ScriptedSource::default()));

        let mut coordinator = coordinator(&harness, store);
        assert!(coordinator.run_once(&CancellationToken::new()).await.is_none());
    }
}
