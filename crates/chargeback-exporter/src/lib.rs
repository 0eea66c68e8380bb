//! # Chargeback Exporter
//!
//! Polls a cloud billing API, aggregates usage into per-resource, per-SKU
//! hourly cost buckets and serves them in the Prometheus exposition format.
//! Buckets that age past the live horizon are bulk-loaded into the
//! time-series store's data directory one block at a time.
//!
//! ## Components
//!
//! - **billing**: authenticated, paginating client with capped retries
//! - **aggregation**: bucket building and the rolling bucket cache
//! - **exporter**: `/metrics`, `/ready`, `/healthz` and self-telemetry
//! - **backfill**: block planning, rendering and atomic commits
//! - **scheduler**: the polling loop and the readiness cell

pub mod aggregation;
pub mod app;
pub mod backfill;
pub mod billing;
pub mod config;
pub mod exporter;
pub mod scheduler;
pub mod snapshot;
pub mod store_api;

pub use config::ExporterConfig;

/// Exporter version
pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
