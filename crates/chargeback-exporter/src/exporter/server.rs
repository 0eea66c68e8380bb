//! HTTP surfaces: `/metrics` on the metrics port, `/ready` and `/healthz`
//! on the health port
//!
//! Handlers only read the last published snapshot and readiness cell; a
//! scrape never waits on the polling cycle.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::collector::bucket_families;
use crate::scheduler::ReadinessReader;
use crate::snapshot::SnapshotReader;

/// State shared by both routers
#[derive(Clone)]
pub struct ExporterState {
    pub snapshots: SnapshotReader,
    pub readiness: ReadinessReader,
    pub registry: Registry,
    pub prefix: Arc<str>,
    pub expose_timestamps: bool,
}

pub fn metrics_router(state: ExporterState, scrape_timeout: Duration) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .layer(TimeoutLayer::new(scrape_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn health_router(state: ExporterState) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Encode the snapshot's live buckets followed by the exporter's own metrics
pub fn render_metrics(state: &ExporterState) -> prometheus::Result<(String, Vec<u8>)> {
    let snapshot = state.snapshots.current();
    let mut families = bucket_families(&state.prefix, &snapshot, state.expose_timestamps);
    families.extend(state.registry.gather());

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}

async fn metrics(State(state): State<ExporterState>) -> Response {
    match render_metrics(&state) {
        Ok((content_type, body)) => ([(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn ready(State(state): State<ExporterState>) -> Response {
    let readiness = state.readiness.get();
    if readiness.is_ready() {
        (StatusCode::OK, readiness.as_str()).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, readiness.as_str()).into_response()
    }
}

async fn healthz() -> &'static str {
    "OK"
}

/// Serve `router` until `cancel` fires
pub async fn serve(listener: TcpListener, router: Router, cancel: CancellationToken, name: &'static str) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(server = name, %addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!(server = name, "HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::BucketSnapshot;
    use crate::exporter::ExporterMetrics;
    use crate::scheduler::readiness_channel;
    use crate::snapshot::snapshot_channel;
    use axum::body::Body;
    use axum::http::Request;
    use chargeback_common::{BucketKey, CostBucket, CostType, ReadinessState, HOUR_MS};
    use http_body_util::BodyExt;
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    async fn get_text(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_ready_reflects_state() {
        let (_publisher, snapshots) = snapshot_channel();
        let (writer, readiness) = readiness_channel();
        let state = ExporterState {
            snapshots,
            readiness,
            registry: Registry::new(),
            prefix: Arc::from("chargeback"),
            expose_timestamps: true,
        };

        let (status, body) = get_text(health_router(state.clone()), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "Starting");

        writer.set(ReadinessState::Ready);
        let (status, body) = get_text(health_router(state.clone()), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Ready");

        let (status, _) = get_text(health_router(state), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_serves_snapshot_and_telemetry() {
        let (publisher, snapshots) = snapshot_channel();
        let (_writer, readiness) = readiness_channel();
        let registry = Registry::new();
        let telemetry = ExporterMetrics::new("chargeback").unwrap();
        telemetry.register(&registry).unwrap();
        telemetry.cached_buckets.set(1);

        let mut bucket = CostBucket::new(BucketKey::new("A", "x", HOUR_MS), HOUR_MS, "USD", CostType::Usage);
        bucket.accumulate(dec!(2.5), dec!(10));
        bucket.sealed = true;
        publisher.publish(BucketSnapshot {
            generation: 1,
            taken_at: HOUR_MS,
            live: vec![bucket],
            pending_backfill: Vec::new(),
        });

        let state = ExporterState {
            snapshots,
            readiness,
            registry,
            prefix: Arc::from("chargeback"),
            expose_timestamps: true,
        };
        let (status, body) = get_text(metrics_router(state, Duration::from_secs(1)), "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(
            "chargeback_bucket_cost{resource_id=\"A\",sku=\"x\",cost_type=\"usage\",currency=\"USD\"} 2.5 3600000"
        ));
        assert!(body.contains("chargeback_exporter_cached_buckets 1"));
    }
}
