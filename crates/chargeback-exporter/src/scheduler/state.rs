//! Cycle phases and the readiness cell

use std::fmt;

use chargeback_common::ReadinessState;
use tokio::sync::watch;

/// Scheduler phase within a polling cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Starting,
    Fetching,
    Aggregating,
    Serving,
    Degraded,
}

impl CyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CyclePhase::Starting => "starting",
            CyclePhase::Fetching => "fetching",
            CyclePhase::Aggregating => "aggregating",
            CyclePhase::Serving => "serving",
            CyclePhase::Degraded => "degraded",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn readiness_channel() -> (ReadinessWriter, ReadinessReader) {
    let (tx, rx) = watch::channel(ReadinessState::Starting);
    (ReadinessWriter { tx }, ReadinessReader { rx })
}

/// Single writer, held by the scheduler
pub struct ReadinessWriter {
    tx: watch::Sender<ReadinessState>,
}

impl ReadinessWriter {
    /// Set the state; returns the previous one
    pub fn set(&self, state: ReadinessState) -> ReadinessState {
        self.tx.send_replace(state)
    }

    pub fn get(&self) -> ReadinessState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ReadinessReader {
        ReadinessReader {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Clone)]
pub struct ReadinessReader {
    rx: watch::Receiver<ReadinessState>,
}

impl ReadinessReader {
    pub fn get(&self) -> ReadinessState {
        *self.rx.borrow()
    }

    /// Wait until readiness equals `state`; false once the writer is gone
    pub async fn wait_for(&mut self, state: ReadinessState) -> bool {
        self.rx.wait_for(|s| *s == state).await.is_ok()
    }
}
