//! Error types for the chargeback exporter
//!
//! Provides a unified error type and the billing/backfill error taxonomies

use std::time::Duration;

use thiserror::Error;

use crate::types::time_range::TimeRange;

/// Result type alias using ChargebackError
pub type Result<T> = std::result::Result<T, ChargebackError>;

/// Unified error type for chargeback operations
#[derive(Debug, Error)]
pub enum ChargebackError {
    // Missing or invalid configuration, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Billing error: {0}")]
    Billing(#[from] BillingError),

    #[error("Backfill error: {0}")]
    Backfill(#[from] BackfillError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Billing API errors
#[derive(Debug, Error)]
pub enum BillingError {
    /// Credentials rejected. Never retried.
    #[error("Billing API rejected credentials (HTTP {status}): {message}")]
    Auth { status: u16, message: String },

    #[error("Billing API rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Transient network failure: {0}")]
    Transient(String),

    /// Malformed or unexpected response
    #[error("Billing API protocol error: {0}")]
    Protocol(String),
}

impl BillingError {
    /// Whether the retry loop may attempt the request again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    /// Short outcome label used in telemetry
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::Transient(_) => "transient",
            Self::Protocol(_) => "protocol_error",
        }
    }
}

/// Block backfill errors
#[derive(Debug, Error)]
pub enum BackfillError {
    /// A block with different content already covers this range
    #[error("Block {range} already exists with digest {existing_digest}")]
    BlockConflict {
        range: TimeRange,
        existing_digest: String,
    },

    /// A committed block was merged away by store compaction, so it can no
    /// longer be replaced without overlapping data
    #[error("Block {range} was compacted by the store ({missing} artifacts gone)")]
    Compacted { range: TimeRange, missing: usize },

    #[error("Time-series store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Block I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackfillError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::BlockConflict { .. })
    }

    /// Retrying the same commit cannot succeed
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Compacted { .. })
    }
}

impl From<serde_json::Error> for ChargebackError {
    fn from(err: serde_json::Error) -> Self {
        ChargebackError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ChargebackError {
    fn from(err: std::io::Error) -> Self {
        ChargebackError::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for ChargebackError {
    fn from(err: anyhow::Error) -> Self {
        ChargebackError::Internal(err.to_string())
    }
}
