//! Metrics exporter
//!
//! - collector: snapshot to Prometheus metric families
//! - server: `/metrics`, `/ready` and `/healthz` routers
//! - telemetry: the exporter's own counters and gauges

pub mod collector;
pub mod server;
pub mod telemetry;

pub use server::{health_router, metrics_router, render_metrics, serve, ExporterState};
pub use telemetry::ExporterMetrics;
