//! Copy-on-write snapshot handoff
//!
//! The scheduler is the only publisher. Readers clone the current `Arc` and
//! never observe a partially built bucket set.

use std::sync::Arc;

use tokio::sync::watch;

use crate::aggregation::BucketSnapshot;

pub fn snapshot_channel() -> (SnapshotPublisher, SnapshotReader) {
    let (tx, rx) = watch::channel(Arc::new(BucketSnapshot::default()));
    (SnapshotPublisher { tx }, SnapshotReader { rx })
}

pub struct SnapshotPublisher {
    tx: watch::Sender<Arc<BucketSnapshot>>,
}

impl SnapshotPublisher {
    /// Replace the published snapshot
    pub fn publish(&self, snapshot: BucketSnapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    pub fn subscribe(&self) -> SnapshotReader {
        SnapshotReader {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Clone)]
pub struct SnapshotReader {
    rx: watch::Receiver<Arc<BucketSnapshot>>,
}

impl SnapshotReader {
    /// Latest published snapshot
    pub fn current(&self) -> Arc<BucketSnapshot> {
        self.rx.borrow().clone()
    }

    /// Wait for a newer snapshot; false once the publisher is gone
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
