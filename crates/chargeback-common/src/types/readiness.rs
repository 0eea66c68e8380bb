//! Process-wide readiness signal

use std::fmt;

use serde::{Deserialize, Serialize};

/// Externally visible health of the exporter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadinessState {
    /// No billing fetch has completed yet
    #[default]
    Starting,
    /// Last billing cycle succeeded
    Ready,
    /// Last billing cycle failed; stale metrics are still served
    Degraded,
}

impl ReadinessState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessState::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadinessState::Starting => "Starting",
            ReadinessState::Ready => "Ready",
            ReadinessState::Degraded => "Degraded",
        }
    }

    /// Numeric encoding for the readiness gauge
    pub fn gauge_value(&self) -> i64 {
        match self {
            ReadinessState::Starting => 0,
            ReadinessState::Ready => 1,
            ReadinessState::Degraded => 2,
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
