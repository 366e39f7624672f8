use std::io;
use std::sync::MutexGuard;

use super::View;
use crate::chunk::{Address, ChunkType, Layer};
use crate::data::DataWriter;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::gc::Copier;
use crate::log::SegmentStore;
use crate::navigator;
use crate::path::Path;
use crate::store::{ChunkBytes, ChunkReader, ChunkWriter};
use crate::{array, wbb};

/// The committed log with a transaction's scratch chunks on top.
///
/// Addresses are resolved in the layer they name. New chunks always go to
/// scratch.
#[derive(Debug)]
pub struct TxStore<'db> {
    durable: &'db SegmentStore,
    scratch: SegmentStore,
}

impl<'db> TxStore<'db> {
    pub(crate) fn new(durable: &'db SegmentStore, scratch: SegmentStore) -> Self {
        Self { durable, scratch }
    }

    pub fn durable(&self) -> &SegmentStore {
        self.durable
    }

    pub fn scratch(&self) -> &SegmentStore {
        &self.scratch
    }
}

impl ChunkReader for TxStore<'_> {
    fn chunk(&self, addr: Address) -> Result<ChunkBytes> {
        match addr.layer() {
            Some(Layer::Scratch) => self.scratch.chunk(addr),
            Some(Layer::Durable) => self.durable.chunk(addr),
            None => Err(Error::InvalidChunk(format!("{:?} names no layer", addr))),
        }
    }
}

impl ChunkWriter for TxStore<'_> {
    fn append(&self, chunk: &[u8]) -> Result<Address> {
        self.scratch.append(chunk)
    }

    fn append_batch(&self, chunks: &[Vec<u8>]) -> Result<Vec<Address>> {
        self.scratch.bulk_append(chunks)
    }
}

/// Blob writer handed to the closures of [`WriteTx::create_data`] and friends.
pub type TxDataWriter<'a, 'db> = DataWriter<&'a TxStore<'db>>;

/// The single active write transaction of a [`Database`].
///
/// Changes are invisible to readers until [`commit`](WriteTx::commit).
/// Dropping the transaction rolls it back.
pub struct WriteTx<'db> {
    db: &'db Database,
    store: TxStore<'db>,
    /// Root this transaction started from.
    base: Address,
    root: Address,
    /// Set after an I/O or corruption error; the transaction can only be
    /// rolled back.
    failed: bool,
    finished: bool,
    _writer: MutexGuard<'db, ()>,
}

impl<'db> WriteTx<'db> {
    pub(crate) fn new(
        db: &'db Database,
        store: TxStore<'db>,
        base: Address,
        writer: MutexGuard<'db, ()>,
    ) -> Self {
        tracing::debug!(base = %base, "Began write transaction");
        Self {
            db,
            store,
            base,
            root: base,
            failed: false,
            finished: false,
            _writer: writer,
        }
    }

    /// Runs one copy-on-write update and adopts the root it returns.
    fn apply<F>(&mut self, update: F) -> Result<()>
    where
        F: FnOnce(&TxStore<'db>, Address) -> Result<Address>,
    {
        if self.failed {
            return Err(Error::Poisoned);
        }
        match update(&self.store, self.root) {
            Ok(root) => {
                self.root = root;
                Ok(())
            }
            Err(e) => {
                if e.is_fatal() {
                    tracing::warn!(error = %e, "Write transaction failed");
                    self.failed = true;
                }
                Err(e)
            }
        }
    }

    /// Creates an empty map at `path`.
    pub fn create_map(&mut self, path: impl Into<Path>) -> Result<()> {
        let path = path.into();
        self.apply(|store, root| {
            navigator::create(store, root, &path, |s| wbb::create_empty(s))
        })
    }

    /// Creates an empty array at `path`.
    pub fn create_array(&mut self, path: impl Into<Path>) -> Result<()> {
        let path = path.into();
        self.apply(|store, root| {
            navigator::create(store, root, &path, |s| array::create_empty(s))
        })
    }

    /// Creates a blob at `path` from whatever `write` feeds the writer.
    ///
    /// Fails with `Error::AlreadyExists` when the key is taken.
    pub fn create_data<F>(&mut self, path: impl Into<Path>, write: F) -> Result<()>
    where
        F: FnOnce(&mut TxDataWriter<'_, 'db>) -> io::Result<()>,
    {
        let path = path.into();
        let db = self.db;
        self.apply(|store, root| {
            navigator::create(store, root, &path, |s| blob(db, s, write))
        })
    }

    /// Stores a blob at `path`, replacing existing data.
    pub fn set_data<F>(&mut self, path: impl Into<Path>, write: F) -> Result<()>
    where
        F: FnOnce(&mut TxDataWriter<'_, 'db>) -> io::Result<()>,
    {
        let path = path.into();
        let db = self.db;
        self.apply(|store, root| {
            navigator::put_data(store, root, &path, |s| blob(db, s, write))
        })
    }

    pub fn put_data(&mut self, path: impl Into<Path>, bytes: &[u8]) -> Result<()> {
        self.set_data(path, |w| io::Write::write_all(w, bytes))
    }

    /// Prepends a blob to the array at `path`.
    pub fn prepend_data<F>(&mut self, path: impl Into<Path>, write: F) -> Result<()>
    where
        F: FnOnce(&mut TxDataWriter<'_, 'db>) -> io::Result<()>,
    {
        let path = path.into();
        let db = self.db;
        self.apply(|store, root| {
            navigator::prepend(store, root, &path, |s| blob(db, s, write))
        })
    }

    /// Prepends an empty map to the array at `path`.
    pub fn prepend_map(&mut self, path: impl Into<Path>) -> Result<()> {
        let path = path.into();
        self.apply(|store, root| {
            navigator::prepend(store, root, &path, |s| wbb::create_empty(s))
        })
    }

    /// Prepends an empty array to the array at `path`.
    pub fn prepend_array(&mut self, path: impl Into<Path>) -> Result<()> {
        let path = path.into();
        self.apply(|store, root| {
            navigator::prepend(store, root, &path, |s| array::create_empty(s))
        })
    }

    /// Drops the oldest element of the array at `path`.
    pub fn delete_last(&mut self, path: impl Into<Path>) -> Result<()> {
        let path = path.into();
        self.apply(|store, root| navigator::delete_last(store, root, &path))
    }

    /// Removes the map entry at `path` and everything under it.
    pub fn delete(&mut self, path: impl Into<Path>) -> Result<()> {
        let path = path.into();
        self.apply(|store, root| navigator::remove(store, root, &path))
    }

    /// Makes the changes durable and visible, returning the published root.
    pub fn commit(mut self) -> Result<Address> {
        if self.failed {
            return Err(Error::Poisoned);
        }
        self.finished = true;
        if self.root == self.base {
            self.discard_scratch();
            tracing::debug!(root = %self.root, "Committed read-only transaction");
            return Ok(self.root);
        }

        let result = self.write_commit();
        self.discard_scratch();
        match result {
            Ok(root) => Ok(root),
            Err(e) => {
                if e.is_fatal() {
                    self.db.poison(&e);
                }
                Err(e)
            }
        }
    }

    /// Copies the scratch chunks the root reaches into the log and appends a
    /// commit naming the translated root.
    fn write_commit(&self) -> Result<Address> {
        let durable = self.store.durable;
        let stats = Copier::new(&self.store, durable, |addr| {
            addr.layer() == Some(Layer::Scratch)
        })
        .run(self.root)?;
        let commit = durable.write_chunk(ChunkType::Commit, &[stats.root], &[])?;
        if self.db.config().sync_on_commit {
            durable.flush()?;
        }
        self.db.publish(stats.root)?;
        tracing::debug!(
            root = %stats.root,
            commit = %commit,
            copied = stats.copied,
            "Committed write transaction"
        );
        Ok(stats.root)
    }

    /// Drops every change made by this transaction.
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.discard_scratch();
        tracing::debug!(base = %self.base, "Rolled back write transaction");
        Ok(())
    }

    fn discard_scratch(&self) {
        if let Err(e) = self.store.scratch.destroy() {
            tracing::warn!(error = %e, "Failed to discard scratch segments");
        }
    }
}

/// Feeds a fresh blob writer to `write` and returns the finished blob.
fn blob<'db, F>(db: &Database, store: &TxStore<'db>, write: F) -> Result<Address>
where
    F: FnOnce(&mut TxDataWriter<'_, 'db>) -> io::Result<()>,
{
    let config = db.config();
    let mut writer = DataWriter::new(store, config.data_leaf_size, config.data_fanout);
    write(&mut writer)?;
    writer.finish()
}

impl<'db> View for WriteTx<'db> {
    type Store = TxStore<'db>;

    fn store(&self) -> &TxStore<'db> {
        &self.store
    }

    fn root(&self) -> Address {
        self.root
    }
}

impl Drop for WriteTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.discard_scratch();
            tracing::debug!(base = %self.base, "Rolled back dropped write transaction");
        }
    }
}
