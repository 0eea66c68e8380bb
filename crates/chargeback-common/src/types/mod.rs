//! Core chargeback types

pub mod cost_bucket;
pub mod metric_sample;
pub mod readiness;
pub mod time_range;
pub mod usage_record;
