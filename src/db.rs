use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, TryLockError};

use crate::chunk::{Address, ChunkType, Layer};
use crate::config::DbConfig;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::gc::{self, CopyStats};
use crate::log::{self, SegmentStore, StoreOptions, SCRATCH_EXTENSION, SEGMENT_EXTENSION};
use crate::store::ChunkWriter;
use crate::tx::{ReadTx, TxStore, View, WriteTx};
use crate::wbb;

/// Outcome of [`Database::compact`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactStats {
    /// Live chunks moved out of the dropped segments
    pub copied: u64,
    /// Segment files dropped
    pub dropped_segments: usize,
}

/// An open database directory
///
/// Any number of [`ReadTx`] may run alongside the single [`WriteTx`].
pub struct Database {
    config: DbConfig,
    durable: SegmentStore,
    /// Root named by the last commit
    root: RwLock<Address>,
    /// Held by the active write transaction
    writer: Mutex<()>,
    poisoned: AtomicBool,
    closed: bool,
    _lock: FileLock,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dir", &self.config.dir)
            .field("root", &self.root)
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

fn store_options(config: &DbConfig) -> StoreOptions {
    StoreOptions::new(config.max_segment_size, config.growth_step)
}

impl Database {
    /// Open database with default configuration
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(DbConfig::new(dir))
    }

    /// Open database with custom configuration
    pub fn open_with_config(config: DbConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;

        // Acquire file lock
        let lock = FileLock::lock_dir(&config.dir)?;

        // A crash mid-transaction leaves its scratch behind
        for (_, path) in log::store::list_segments(&config.dir, SCRATCH_EXTENSION)? {
            tracing::warn!(path = %path.display(), "Removing leftover scratch file");
            fs::remove_file(&path)?;
        }

        let durable = SegmentStore::open(&config.dir, Layer::Durable, store_options(&config))?;
        let recovered = log::recover(&durable)?;
        let root = match recovered.root {
            Some(root) => root,
            None => {
                let root = wbb::create_empty(&durable)?;
                durable.write_chunk(ChunkType::Commit, &[root], &[])?;
                durable.flush()?;
                root
            }
        };

        tracing::info!(
            dir = %config.dir.display(),
            root = %root,
            segments = durable.segments().len(),
            discarded = recovered.discarded,
            "Opened database"
        );

        Ok(Self {
            config,
            durable,
            root: RwLock::new(root),
            writer: Mutex::new(()),
            poisoned: AtomicBool::new(false),
            closed: false,
            _lock: lock,
        })
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Root published by the last commit
    pub fn root(&self) -> Result<Address> {
        Ok(*self.root.read()?)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Start a read transaction on the latest commit
    pub fn read_tx(&self) -> Result<ReadTx> {
        // Pin the segments while the root cannot move, so compaction cannot
        // drop a segment the root still reaches.
        let root = self.root.read()?;
        Ok(ReadTx::new(self.durable.snapshot(), *root))
    }

    fn try_writer(&self) -> Result<MutexGuard<'_, ()>> {
        match self.writer.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(Error::TransactionInProgress),
            Err(TryLockError::Poisoned(e)) => Err(e.into()),
        }
    }

    /// Start the write transaction
    ///
    /// Returns `Error::TransactionInProgress` while another one is active.
    pub fn tx(&self) -> Result<WriteTx<'_>> {
        let writer = self.try_writer()?;
        if self.is_poisoned() {
            return Err(Error::Poisoned);
        }
        let scratch = SegmentStore::create_fresh(
            &self.config.dir,
            Layer::Scratch,
            store_options(&self.config).extension(SCRATCH_EXTENSION),
        )?;
        let base = self.root()?;
        Ok(WriteTx::new(
            self,
            TxStore::new(&self.durable, scratch),
            base,
            writer,
        ))
    }

    pub(crate) fn publish(&self, root: Address) -> Result<()> {
        *self.root.write()? = root;
        Ok(())
    }

    pub(crate) fn poison(&self, err: &Error) {
        tracing::error!(error = %err, "Commit failed, refusing further writes until reopened");
        self.poisoned.store(true, Ordering::SeqCst);
    }

    fn check_fatal<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.poison(e);
            }
        }
        result
    }

    /// Moves the live chunks of every full segment to the tail of the log
    /// and deletes those segments.
    pub fn compact(&self) -> Result<CompactStats> {
        let _writer = self.try_writer()?;
        if self.is_poisoned() {
            return Err(Error::Poisoned);
        }

        let segments = self.durable.segments();
        let (first, current) = match (segments.first(), segments.last()) {
            (Some(first), Some(current)) => (first.start(), current.start()),
            _ => return Ok(CompactStats::default()),
        };
        if first == current {
            return Ok(CompactStats::default());
        }
        drop(segments);

        let boundary = Address::new(Layer::Durable, current);
        let root = self.root()?;
        let stats = self.check_fatal(self.evacuate(root, boundary))?;

        let dropped = {
            let mut published = self.root.write()?;
            *published = stats.root;
            self.durable.drop_before(boundary)?
        };

        tracing::info!(
            root = %stats.root,
            copied = stats.copied,
            dropped_segments = dropped,
            "Compacted database"
        );
        Ok(CompactStats {
            copied: stats.copied,
            dropped_segments: dropped,
        })
    }

    fn evacuate(&self, root: Address, boundary: Address) -> Result<CopyStats> {
        let stats = gc::evacuate_below(&self.durable, root, boundary)?;
        // The dropped segments may hold the only commit, so always write one.
        self.durable.write_chunk(ChunkType::Commit, &[stats.root], &[])?;
        self.durable.flush()?;
        Ok(stats)
    }

    /// Writes the live part of the latest commit into a new database at `dir`
    pub fn copy_to(&self, dir: impl AsRef<Path>) -> Result<CopyStats> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let _lock = FileLock::lock_dir(dir)?;
        if !log::store::list_segments(dir, SEGMENT_EXTENSION)?.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{} already holds a database",
                dir.display()
            )));
        }

        let dst = SegmentStore::open(dir, Layer::Durable, store_options(&self.config))?;
        let snapshot = self.read_tx()?;
        let stats = gc::copy(snapshot.store(), snapshot.root(), &dst, self.config.dedup_on_copy)?;
        dst.close()?;

        tracing::info!(
            dir = %dir.display(),
            copied = stats.copied,
            deduplicated = stats.deduplicated,
            "Copied database"
        );
        Ok(stats)
    }

    /// Trims the current segment and releases the directory lock
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.durable.close()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.durable.close() {
            tracing::warn!(dir = %self.config.dir.display(), error = %e, "Failed to close database");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigator::{Entity, EntityType};
    use std::io::Write;
    use std::ops::ControlFlow;

    fn small_config(dir: &Path) -> DbConfig {
        DbConfig::new(dir)
            .max_segment_size(4096)
            .growth_step(1024)
            .data_leaf_size(16)
            .data_fanout(4)
            .sync_on_commit(false)
    }

    fn array_values<V: View>(view: &V, path: &str) -> Vec<u64> {
        let mut values = Vec::new();
        view.for_each_array_element(path, |_, entity| {
            let bytes = match entity {
                Entity::Data(addr) => crate::data::read_all(view.store(), addr).unwrap(),
                other => panic!("unexpected {:?}", other),
            };
            values.push(u64::from_be_bytes(bytes.try_into().unwrap()));
            ControlFlow::Continue(())
        })
        .unwrap();
        values
    }

    #[test]
    fn test_map_create_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();

        let mut tx = db.tx().unwrap();
        tx.create_map("/test").unwrap();
        tx.put_data("/test/abc", &[1, 2, 3]).unwrap();
        tx.commit().unwrap();

        let read = db.read_tx().unwrap();
        assert_eq!(read.get_data("/test/abc").unwrap(), vec![1, 2, 3]);
        assert_eq!(read.get_size("/test").unwrap(), 1);
        assert_eq!(read.get_type("/test").unwrap(), EntityType::Map);
        assert_eq!(read.get_type("/test/abc").unwrap(), EntityType::Data);
    }

    #[test]
    fn test_round_robin_array() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_with_config(small_config(dir.path())).unwrap();

        let mut tx = db.tx().unwrap();
        tx.create_array("/ar").unwrap();
        for j in 0..5u64 {
            tx.prepend_data("/ar", |w| w.write_all(&j.to_be_bytes())).unwrap();
        }
        tx.commit().unwrap();
        assert_eq!(array_values(&db.read_tx().unwrap(), "/ar"), vec![4, 3, 2, 1, 0]);

        for (next, expected) in [(5u64, vec![5, 4, 3, 2, 1]), (6, vec![6, 5, 4, 3, 2])] {
            let mut tx = db.tx().unwrap();
            tx.prepend_data("/ar", |w| w.write_all(&next.to_be_bytes())).unwrap();
            tx.delete_last("/ar").unwrap();
            tx.commit().unwrap();
            assert_eq!(array_values(&db.read_tx().unwrap(), "/ar"), expected);
        }
    }

    #[test]
    fn test_reopen_persists_commits() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            let mut tx = db.tx().unwrap();
            tx.create_map("/test").unwrap();
            tx.commit().unwrap();
            db.close().unwrap();
        }

        let db = Database::open(dir.path()).unwrap();
        let read = db.read_tx().unwrap();
        assert_eq!(read.get_size("").unwrap(), 1);
        assert_eq!(read.get_type("/test").unwrap(), EntityType::Map);
        assert_eq!(read.get_size("/test").unwrap(), 0);
    }

    #[test]
    fn test_second_writer_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();

        let tx = db.tx().unwrap();
        assert!(matches!(db.tx(), Err(Error::TransactionInProgress)));
        assert!(matches!(db.compact(), Err(Error::TransactionInProgress)));
        drop(tx);
        db.tx().unwrap().rollback().unwrap();
    }

    #[test]
    fn test_directory_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let _db = Database::open(dir.path()).unwrap();
        assert!(matches!(Database::open(dir.path()), Err(Error::Locked(_))));
    }

    #[test]
    fn test_rollback_discards_changes() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let before = db.root().unwrap();

        let mut tx = db.tx().unwrap();
        tx.create_map("/gone").unwrap();
        assert!(tx.exists("/gone").unwrap());
        tx.rollback().unwrap();

        assert_eq!(db.root().unwrap(), before);
        assert!(!db.read_tx().unwrap().exists("/gone").unwrap());
        let scratch = log::store::list_segments(dir.path(), SCRATCH_EXTENSION).unwrap();
        assert!(scratch.is_empty());
    }

    #[test]
    fn test_unchanged_commit_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let next = db.durable.next_chunk_address().unwrap();

        let tx = db.tx().unwrap();
        tx.commit().unwrap();
        assert_eq!(db.durable.next_chunk_address().unwrap(), next);
    }

    #[test]
    fn test_domain_errors_keep_transaction_usable() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();

        let mut tx = db.tx().unwrap();
        tx.create_map("/m").unwrap();
        tx.create_array("/a").unwrap();
        assert!(matches!(tx.create_map("/m"), Err(Error::AlreadyExists)));
        assert!(matches!(tx.delete("/missing"), Err(Error::NotFound)));
        assert!(matches!(tx.delete_last("/a"), Err(Error::ArrayEmpty)));
        assert!(matches!(tx.prepend_map("/m"), Err(Error::NotArray)));
        assert!(matches!(tx.get_data("/m"), Err(Error::NotData)));
        assert!(matches!(tx.create_map("/a/x"), Err(Error::NotMap)));
        tx.prepend_map("/a").unwrap();
        tx.put_data("/a/0/leaf", b"deep").unwrap();
        tx.commit().unwrap();

        assert!(!db.is_poisoned());
        let read = db.read_tx().unwrap();
        assert_eq!(read.get_data("/a/0/leaf").unwrap(), b"deep");
        assert!(!read.exists("/a/1").unwrap());
    }

    #[test]
    fn test_large_blob_round_trip_and_seek() {
        use std::io::{Read, Seek, SeekFrom};

        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_with_config(small_config(dir.path())).unwrap();
        let blob: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        let mut tx = db.tx().unwrap();
        tx.create_data("/blob", |w| {
            for part in blob.chunks(333) {
                w.write_all(part)?;
            }
            Ok(())
        })
        .unwrap();
        tx.commit().unwrap();

        let read = db.read_tx().unwrap();
        assert_eq!(read.get_size("/blob").unwrap(), 5000);
        assert_eq!(read.get_data("/blob").unwrap(), blob);

        let mut reader = read.data_reader("/blob").unwrap();
        reader.seek(SeekFrom::Start(4321)).unwrap();
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &blob[4321..]);
    }

    #[test]
    fn test_set_data_replaces_blob() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();

        let mut tx = db.tx().unwrap();
        tx.put_data("/k", b"one").unwrap();
        tx.set_data("/k", |w| w.write_all(b"two")).unwrap();
        assert!(matches!(
            tx.create_data("/k", |w| w.write_all(b"three")),
            Err(Error::AlreadyExists)
        ));
        tx.create_map("/m").unwrap();
        assert!(matches!(tx.put_data("/m", b"x"), Err(Error::NotData)));
        tx.commit().unwrap();

        assert_eq!(db.read_tx().unwrap().get_data("/k").unwrap(), b"two");
    }

    #[test]
    fn test_map_iteration_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();

        let mut tx = db.tx().unwrap();
        tx.create_map("/m").unwrap();
        for key in ["delta", "alpha", "charlie", "bravo"] {
            tx.put_data(format!("/m/{}", key).as_str(), key.as_bytes()).unwrap();
        }
        tx.delete("/m/charlie").unwrap();
        tx.commit().unwrap();

        let read = db.read_tx().unwrap();
        let mut keys = Vec::new();
        read.for_each_map_entry("/m", |key, entity| {
            assert_eq!(entity.entity_type(), EntityType::Data);
            keys.push(String::from_utf8(key.to_vec()).unwrap());
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(keys, vec!["alpha", "bravo", "delta"]);

        let mut first = None;
        read.for_each_map_entry("/m", |key, _| {
            first = Some(key.to_vec());
            ControlFlow::Break(())
        })
        .unwrap();
        assert_eq!(first.as_deref(), Some(&b"alpha"[..]));
    }

    #[test]
    fn test_readers_see_whole_commits() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_with_config(small_config(dir.path())).unwrap();
        let mut tx = db.tx().unwrap();
        tx.create_map("/pair").unwrap();
        tx.commit().unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..50u64 {
                    let mut tx = db.tx().unwrap();
                    tx.put_data("/pair/a", &i.to_be_bytes()).unwrap();
                    tx.put_data("/pair/b", &i.to_be_bytes()).unwrap();
                    tx.commit().unwrap();
                }
            });
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let read = db.read_tx().unwrap();
                        if read.exists("/pair/a").unwrap() {
                            assert_eq!(
                                read.get_data("/pair/a").unwrap(),
                                read.get_data("/pair/b").unwrap()
                            );
                        } else {
                            assert!(!read.exists("/pair/b").unwrap());
                        }
                    }
                });
            }
        });
    }

    #[test]
    fn test_compact_drops_full_segments() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_with_config(small_config(dir.path())).unwrap();

        let mut tx = db.tx().unwrap();
        tx.put_data("/static", b"written once").unwrap();
        tx.commit().unwrap();
        for round in 0..20u64 {
            let mut tx = db.tx().unwrap();
            tx.put_data("/blob", &round.to_be_bytes().repeat(64)).unwrap();
            tx.commit().unwrap();
        }
        let before = db.durable.segments().len();
        assert!(before > 2);

        let old = db.read_tx().unwrap();
        let stats = db.compact().unwrap();
        assert_eq!(stats.dropped_segments, before - 1);
        assert!(stats.copied > 0);

        // A reader from before compaction keeps its segments.
        assert_eq!(old.get_data("/blob").unwrap(), 19u64.to_be_bytes().repeat(64));
        old.discard();

        let expected = 19u64.to_be_bytes().repeat(64);
        assert_eq!(db.read_tx().unwrap().get_data("/blob").unwrap(), expected);
        db.close().unwrap();

        let db = Database::open_with_config(small_config(dir.path())).unwrap();
        let read = db.read_tx().unwrap();
        assert_eq!(read.get_data("/blob").unwrap(), expected);
        assert_eq!(read.get_data("/static").unwrap(), b"written once");
    }

    #[test]
    fn test_reopen_after_crash_with_pinned_dropped_segments() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_with_config(small_config(dir.path())).unwrap();
        let churn = |db: &Database, rounds: std::ops::Range<u64>| {
            for round in rounds {
                let mut tx = db.tx().unwrap();
                tx.put_data("/blob", &round.to_be_bytes().repeat(64)).unwrap();
                tx.commit().unwrap();
            }
        };

        churn(&db, 0..20);
        let pinned: Vec<PathBuf> = db
            .durable
            .segments()
            .iter()
            .map(|s| s.path().to_path_buf())
            .collect();
        let old = db.read_tx().unwrap();
        db.compact().unwrap();
        churn(&db, 20..40);
        db.compact().unwrap();

        // The process dies while the old reader still pins its segments, so
        // they stay on disk while the later dropped ones are gone.
        std::mem::forget(old);
        drop(db);
        assert!(pinned.iter().all(|path| path.exists()));

        let db = Database::open_with_config(small_config(dir.path())).unwrap();
        assert_eq!(
            db.read_tx().unwrap().get_data("/blob").unwrap(),
            39u64.to_be_bytes().repeat(64)
        );
        assert!(pinned.iter().all(|path| !path.exists()));

        let mut tx = db.tx().unwrap();
        tx.put_data("/after", b"reopen").unwrap();
        tx.commit().unwrap();
        assert_eq!(db.read_tx().unwrap().get_data("/after").unwrap(), b"reopen");
    }

    #[test]
    fn test_copy_to_keeps_only_live_data() {
        let dir = tempfile::tempdir().unwrap();
        let copy_dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();

        for round in 0..10u8 {
            let mut tx = db.tx().unwrap();
            tx.put_data("/value", &[round; 100]).unwrap();
            tx.commit().unwrap();
        }
        let stats = db.copy_to(copy_dir.path()).unwrap();
        assert!(matches!(db.copy_to(copy_dir.path()), Err(Error::InvalidInput(_))));

        let copy = Database::open(copy_dir.path()).unwrap();
        assert_eq!(copy.root().unwrap(), stats.root);
        assert_eq!(copy.read_tx().unwrap().get_data("/value").unwrap(), vec![9; 100]);
        assert!(copy.durable.next_chunk_address().unwrap() < db.durable.next_chunk_address().unwrap());
    }

    #[test]
    fn test_uncommitted_tail_is_discarded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            let mut tx = db.tx().unwrap();
            tx.put_data("/kept", b"yes").unwrap();
            tx.commit().unwrap();
            // Chunks of a commit that never finished.
            db.durable.write_chunk(ChunkType::DataLeaf, &[], b"torn").unwrap();
            db.durable.flush().unwrap();
        }

        let db = Database::open(dir.path()).unwrap();
        let read = db.read_tx().unwrap();
        assert_eq!(read.get_data("/kept").unwrap(), b"yes");
        assert_eq!(read.get_size("").unwrap(), 1);
    }

    #[test]
    fn test_leftover_scratch_is_removed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            let mut tx = db.tx().unwrap();
            tx.put_data("/lost", b"never committed").unwrap();
            // Simulate a crash: the scratch files stay behind.
            std::mem::forget(tx);
        }
        let scratch = log::store::list_segments(dir.path(), SCRATCH_EXTENSION).unwrap();
        assert!(!scratch.is_empty());

        let db = Database::open(dir.path()).unwrap();
        assert!(!db.read_tx().unwrap().exists("/lost").unwrap());
        let scratch = log::store::list_segments(dir.path(), SCRATCH_EXTENSION).unwrap();
        assert!(scratch.is_empty());
    }
}
