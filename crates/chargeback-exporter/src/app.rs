//! Process wiring: one scheduler task, one backfill task, two HTTP servers

use std::sync::Arc;
use std::time::Duration;

use chargeback_common::{bucket_cost_metric, ChargebackError, Result};
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregation::{AggregationRules, CostAggregator};
use crate::backfill::{BackfillCoordinator, FsBlockStore};
use crate::billing::BillingClient;
use crate::config::{ExporterConfig, SinkKind};
use crate::exporter::{health_router, metrics_router, serve, ExporterMetrics, ExporterState};
use crate::scheduler::{readiness_channel, Scheduler, SchedulerOptions};
use crate::snapshot::snapshot_channel;
use crate::store_api::StoreApiClient;

const STORE_API_TIMEOUT: Duration = Duration::from_secs(10);
const REPORT_CHANNEL_CAPACITY: usize = 16;

/// Run the exporter until `cancel` fires
pub async fn run(config: ExporterConfig, cancel: CancellationToken) -> Result<()> {
    let config = Arc::new(config);
    let prefix = config.exporter.metric_prefix.clone();

    let registry = Registry::new();
    let metrics = ExporterMetrics::new(&prefix)
        .and_then(|m| m.register(&registry).map(|_| m))
        .map_err(|e| ChargebackError::Internal(format!("Failed to register metrics: {}", e)))?;

    let billing = Arc::new(BillingClient::new(&config.billing, &config.aggregation.default_currency)?);
    let (readiness_writer, readiness) = readiness_channel();
    let (publisher, snapshots) = snapshot_channel();
    let (report_tx, report_rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);

    let history_floor = history_floor(&config, &prefix).await;

    let scheduler = Scheduler::new(
        billing,
        CostAggregator::new(AggregationRules::from_settings(&config.aggregation)),
        SchedulerOptions::from_config(&config),
        readiness_writer,
        publisher,
        report_rx,
    )
    .with_metrics(metrics.clone())
    .with_history_floor(history_floor);

    let state = ExporterState {
        snapshots: snapshots.clone(),
        readiness: readiness.clone(),
        registry,
        prefix: Arc::from(prefix.as_str()),
        expose_timestamps: config.exporter.expose_timestamps,
    };

    let metrics_addr = config.exporter.metrics_addr()?;
    let health_addr = config.exporter.health_addr()?;
    let metrics_listener = bind(metrics_addr).await?;
    let health_listener = bind(health_addr).await?;

    let mut tasks = vec![
        spawn_server(
            metrics_listener,
            metrics_router(state.clone(), config.exporter.scrape_timeout()),
            cancel.clone(),
            "metrics",
        ),
        spawn_server(health_listener, health_router(state), cancel.clone(), "health"),
        tokio::spawn(scheduler.run(cancel.clone())),
    ];

    if config.backfill.enabled {
        if config.store.sink == SinkKind::Directory {
            warn!(
                data_dir = %config.store.data_dir.display(),
                "Directory sink writes OpenMetrics files only, an external loader must import them"
            );
        }
        let mut store = FsBlockStore::from_settings(&config.store, config.backfill.block_duration_ms());
        if let Some(url) = &config.store.url {
            store = store.with_api(StoreApiClient::new(url, None, None, STORE_API_TIMEOUT)?);
        }
        let coordinator = BackfillCoordinator::new(
            Arc::new(store),
            snapshots,
            readiness,
            report_tx,
            prefix.clone(),
            config.backfill.block_duration_ms(),
            config.backfill.interval(),
            config.backfill.max_attempts,
        )
        .with_metrics(metrics);
        tasks.push(tokio::spawn(coordinator.run(cancel.clone())));
    } else {
        info!("Backfill disabled");
        drop(report_tx);
    }

    info!(%metrics_addr, %health_addr, prefix = %prefix, "Chargeback exporter running");

    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!(error = %e, "Task panicked");
        }
    }

    info!("Chargeback exporter stopped");
    Ok(())
}

/// Newest bucket timestamp already in the store, when a query API is configured
async fn history_floor(config: &ExporterConfig, prefix: &str) -> Option<i64> {
    let url = config.metrics_api.url.as_deref()?;
    let api = match StoreApiClient::new(
        url,
        config.metrics_api.username.clone(),
        config.metrics_api.password.clone(),
        STORE_API_TIMEOUT,
    ) {
        Ok(api) => api,
        Err(e) => {
            warn!(error = %e, "Skipping startup reconciliation");
            return None;
        }
    };

    match api.latest_sample_timestamp(&bucket_cost_metric(prefix)).await {
        Ok(floor) => {
            info!(?floor, "Startup reconciliation with stored history");
            floor
        }
        Err(e) => {
            warn!(error = %e, "Startup reconciliation failed, using full lookback");
            None
        }
    }
}

async fn bind(addr: std::net::SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ChargebackError::Config(format!("Failed to bind {}: {}", addr, e)))
}

fn spawn_server(
    listener: TcpListener,
    router: axum::Router,
    cancel: CancellationToken,
    name: &'static str,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = serve(listener, router, cancel.clone(), name).await {
            error!(server = name, error = %e, "HTTP server failed, shutting down");
            cancel.cancel();
        }
    })
}
