//! Historical backfill
//!
//! Aged, sealed buckets are written into the store's data directory one
//! block at a time:
//! - job: splitting buckets at block boundaries
//! - openmetrics: deterministic block rendering
//! - store: atomic, manifest-tracked block commits
//! - coordinator: cadence, conflict recomputation and reporting

pub mod coordinator;
pub mod job;
pub mod openmetrics;
pub mod store;

pub use coordinator::{BackfillCoordinator, BackfillReport, BlockOutcome, BlockResult};
pub use job::{BackfillJob, BlockPlan};
pub use store::{BlockManifest, BlockSink, BlockStore, CommitMode, CommitOutcome, FsBlockStore, RenderedBlock};
