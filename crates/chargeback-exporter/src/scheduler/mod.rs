//! Scheduler: the process-wide polling loop and the readiness cell

pub mod driver;
pub mod state;

pub use driver::{CycleOutcome, CycleReport, Scheduler, SchedulerOptions};
pub use state::{readiness_channel, CyclePhase, ReadinessReader, ReadinessWriter};
