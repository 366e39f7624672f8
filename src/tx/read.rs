use super::View;
use crate::chunk::Address;
use crate::log::Snapshot;

/// A consistent, read-only view of one committed root.
///
/// The segments the view can reach stay on disk until it is dropped, even if
/// compaction removes them from the database in the meantime.
#[derive(Debug, Clone)]
pub struct ReadTx {
    store: Snapshot,
    root: Address,
}

impl ReadTx {
    pub(crate) fn new(store: Snapshot, root: Address) -> Self {
        Self { store, root }
    }

    /// Releases the snapshot.
    pub fn discard(self) {}
}

impl View for ReadTx {
    type Store = Snapshot;

    fn store(&self) -> &Snapshot {
        &self.store
    }

    fn root(&self) -> Address {
        self.root
    }
}
