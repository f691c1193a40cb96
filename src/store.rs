use crate::snapshot::Snapshot;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Holds the snapshot currently in effect.
///
/// There is a single writer (the watcher calling [`SnapshotStore::update`])
/// and many readers (connection tasks and the TLS certificate resolver).
/// Readers take a reference counted handle to the whole snapshot, so a
/// request keeps seeing the snapshot it started with even if an update
/// lands while it is in flight. No lock is held across a request.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: ArcSwap<Snapshot>,
}

impl SnapshotStore {
    pub fn new(initial: Snapshot) -> Self {
        SnapshotStore {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Replaces the current snapshot. Never blocks on readers.
    pub fn update(&self, snapshot: Snapshot) {
        self.current.store(Arc::new(snapshot));
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }
}
