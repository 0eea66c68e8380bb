//! Exporter self-telemetry

use chargeback_common::ReadinessState;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Prometheus metrics describing the exporter itself
#[derive(Clone)]
pub struct ExporterMetrics {
    pub fetch_total: IntCounterVec,
    pub records_skipped_total: IntCounter,
    pub late_revisions_total: IntCounter,
    pub backfill_blocks_total: IntCounterVec,
    pub cycle_duration_seconds: Histogram,
    pub cached_buckets: IntGauge,
    pub last_success_timestamp_seconds: IntGauge,
    pub readiness: IntGauge,
}

impl ExporterMetrics {
    pub fn new(prefix: &str) -> prometheus::Result<Self> {
        Ok(Self {
            fetch_total: IntCounterVec::new(
                Opts::new(
                    format!("{prefix}_exporter_fetch_total"),
                    "Billing fetch cycles by outcome",
                ),
                &["outcome"],
            )?,
            records_skipped_total: IntCounter::new(
                format!("{prefix}_exporter_records_skipped_total"),
                "Usage records skipped by validation",
            )?,
            late_revisions_total: IntCounter::new(
                format!("{prefix}_exporter_late_revisions_total"),
                "Recomputations of sealed buckets that were ignored",
            )?,
            backfill_blocks_total: IntCounterVec::new(
                Opts::new(
                    format!("{prefix}_exporter_backfill_blocks_total"),
                    "Backfill block commits by outcome",
                ),
                &["outcome"],
            )?,
            cycle_duration_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    format!("{prefix}_exporter_cycle_duration_seconds"),
                    "Polling cycle duration",
                )
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            )?,
            cached_buckets: IntGauge::new(
                format!("{prefix}_exporter_cached_buckets"),
                "Buckets held in the rolling cache",
            )?,
            last_success_timestamp_seconds: IntGauge::new(
                format!("{prefix}_exporter_last_success_timestamp_seconds"),
                "Unix time of the last successful polling cycle",
            )?,
            readiness: IntGauge::new(
                format!("{prefix}_exporter_readiness"),
                "Readiness state (0 starting, 1 ready, 2 degraded)",
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.fetch_total.clone()))?;
        registry.register(Box::new(self.records_skipped_total.clone()))?;
        registry.register(Box::new(self.late_revisions_total.clone()))?;
        registry.register(Box::new(self.backfill_blocks_total.clone()))?;
        registry.register(Box::new(self.cycle_duration_seconds.clone()))?;
        registry.register(Box::new(self.cached_buckets.clone()))?;
        registry.register(Box::new(self.last_success_timestamp_seconds.clone()))?;
        registry.register(Box::new(self.readiness.clone()))?;
        Ok(())
    }

    pub fn record_fetch(&self, outcome: &str) {
        self.fetch_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_block(&self, outcome: &str) {
        self.backfill_blocks_total.with_label_values(&[outcome]).inc();
    }

    pub fn set_readiness(&self, state: ReadinessState) {
        self.readiness.set(state.gauge_value());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_gather() {
        let registry = Registry::new();
        let metrics = ExporterMetrics::new("chargeback").unwrap();
        metrics.register(&registry).unwrap();

        metrics.record_fetch("success");
        metrics.set_readiness(ReadinessState::Degraded);

        let families = registry.gather();
        let fetch = families
            .iter()
            .find(|f| f.get_name() == "chargeback_exporter_fetch_total")
            .unwrap();
        assert_eq!(fetch.get_metric()[0].get_counter().get_value(), 1.0);
        assert_eq!(metrics.readiness.get(), 2);

        // a second registration of the same names is rejected
        assert!(metrics.register(&registry).is_err());
    }
}
