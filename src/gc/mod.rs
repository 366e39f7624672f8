//! Reachability-based garbage collection.
//!
//! A full copy moves everything reachable from a root into another store and
//! leaves the garbage behind. Evacuation copies the reachable chunks of an
//! address range to the tail of the same store, after which the segments of
//! that range hold only garbage and can be dropped.

mod copier;

pub use copier::{Copier, CopyStats};

use std::collections::HashSet;

use crate::chunk::{Address, ChunkType};
use crate::error::Result;
use crate::store::{ChunkReader, ChunkWriter};

/// Copies the graph under `root` into `dst`, appends a commit naming the new
/// root and flushes `dst`.
pub fn copy<R, W>(src: &R, root: Address, dst: &W, dedup: bool) -> Result<CopyStats>
where
    R: ChunkReader + ?Sized,
    W: ChunkWriter + ?Sized,
{
    let stats = Copier::new(src, dst, |_| true).with_dedup(dedup).run(root)?;
    dst.write_chunk(ChunkType::Commit, &[stats.root], &[])?;
    dst.flush()?;
    tracing::info!(
        root = %stats.root,
        copied = stats.copied,
        deduplicated = stats.deduplicated,
        "Copied reachable chunks"
    );
    Ok(stats)
}

/// Copies the reachable chunks at or above `from` to the tail of `store`.
pub fn evacuate<S>(store: &S, root: Address, from: Address) -> Result<CopyStats>
where
    S: ChunkWriter + ?Sized,
{
    evacuate_where(store, root, |addr| addr.layer() == from.layer() && addr >= from)
}

/// Copies the reachable chunks below `before` to the tail of `store`.
pub fn evacuate_below<S>(store: &S, root: Address, before: Address) -> Result<CopyStats>
where
    S: ChunkWriter + ?Sized,
{
    evacuate_where(store, root, |addr| addr.layer() == before.layer() && addr < before)
}

fn evacuate_where<S, P>(store: &S, root: Address, select: P) -> Result<CopyStats>
where
    S: ChunkWriter + ?Sized,
    P: Fn(Address) -> bool,
{
    let stats = Copier::new(store, store, select).run(root)?;
    tracing::debug!(root = %stats.root, copied = stats.copied, "Evacuated chunks");
    Ok(stats)
}

/// Every address reachable from `root`, `root` included.
pub fn reachable<R: ChunkReader + ?Sized>(store: &R, root: Address) -> Result<HashSet<Address>> {
    let mut seen = HashSet::new();
    let mut pending = vec![root];
    while let Some(addr) = pending.pop() {
        if addr.is_nil() || !seen.insert(addr) {
            continue;
        }
        let bytes = store.chunk(addr)?;
        pending.extend(bytes.decode()?.refs.iter());
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Layer;
    use crate::log::{SegmentStore, StoreOptions};
    use crate::store::MemStore;
    use crate::{array, data, wbb};

    fn leaf(store: &MemStore, bytes: &[u8]) -> Address {
        store.write_chunk(ChunkType::DataLeaf, &[], bytes).unwrap()
    }

    fn payloads(store: &MemStore) -> Vec<(ChunkType, Vec<u8>)> {
        store
            .chunks()
            .iter()
            .map(|(_, bytes)| {
                let chunk = bytes.decode().unwrap();
                (chunk.kind, chunk.data.to_vec())
            })
            .collect()
    }

    #[test]
    fn test_copy_keeps_only_reachable() {
        let src = MemStore::new();
        let c: Vec<Address> = (0..5u8).map(|i| leaf(&src, &[i])).collect();
        let c5 = src.write_chunk(ChunkType::ArrayLeaf, &[c[2], c[4]], &[]).unwrap();
        src.write_chunk(ChunkType::Commit, &[c5], &[]).unwrap();

        let dst = MemStore::new();
        let stats = copy(&src, c5, &dst, true).unwrap();
        assert_eq!(stats.copied, 3);

        assert_eq!(
            payloads(&dst),
            vec![
                (ChunkType::DataLeaf, vec![2]),
                (ChunkType::DataLeaf, vec![4]),
                (ChunkType::ArrayLeaf, vec![]),
                (ChunkType::Commit, vec![]),
            ]
        );

        let live = reachable(&dst, stats.root).unwrap();
        let stored: HashSet<Address> = dst
            .chunks()
            .iter()
            .filter(|(_, bytes)| bytes.decode().unwrap().kind != ChunkType::Commit)
            .map(|(addr, _)| *addr)
            .collect();
        assert_eq!(live, stored);
        assert_eq!(live.len(), 3);
    }

    #[test]
    fn test_dedup_collapses_identical_leaves() {
        let src = MemStore::new();
        let a = leaf(&src, b"same");
        let b = leaf(&src, b"same");
        let c = leaf(&src, b"other");
        let root = src.write_chunk(ChunkType::ArrayLeaf, &[a, b, c, a], &[]).unwrap();

        let dst = MemStore::new();
        let stats = copy(&src, root, &dst, true).unwrap();
        assert_eq!(stats.deduplicated, 1);
        // Two distinct leaves, the array and the commit.
        assert_eq!(dst.len(), 4);
        let elements = array::iter(&dst, stats.root)
            .unwrap()
            .map(|e| e.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(elements[0], elements[1]);
        assert_eq!(elements[0], elements[3]);
        assert_ne!(elements[0], elements[2]);

        let plain = MemStore::new();
        let stats = copy(&src, root, &plain, false).unwrap();
        assert_eq!(stats.deduplicated, 0);
        assert_eq!(plain.len(), 5);
    }

    #[test]
    fn test_copy_of_nested_entities_reads_back() {
        let src = MemStore::new();
        let mut map = wbb::create_empty(&src).unwrap();
        for i in 0..50u32 {
            let blob = data::write_all(&src, &i.to_be_bytes().repeat(10), 8, 3).unwrap();
            map = wbb::insert(&src, map, format!("k{:03}", i).as_bytes(), blob).unwrap();
        }
        // Garbage: an overwritten value.
        let stale = data::write_all(&src, b"stale", 8, 3).unwrap();
        let with_stale = wbb::insert(&src, map, b"k000", stale).unwrap();
        let map = wbb::insert(&src, with_stale, b"k000", wbb::search(&src, map, b"k000").unwrap())
            .unwrap();

        let dst = MemStore::new();
        let stats = copy(&src, map, &dst, true).unwrap();
        assert!(dst.len() < src.len());
        assert_eq!(wbb::count(&dst, stats.root).unwrap(), 50);
        for i in 0..50u32 {
            let blob = wbb::search(&dst, stats.root, format!("k{:03}", i).as_bytes()).unwrap();
            assert_eq!(data::read_all(&dst, blob).unwrap(), i.to_be_bytes().repeat(10));
        }
        assert!(wbb::is_balanced(&dst, stats.root).unwrap());
    }

    #[test]
    fn test_evacuate_below_frees_old_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(dir.path(), Layer::Durable, StoreOptions::new(256, 64)).unwrap();

        let mut arr = array::create_empty(&store).unwrap();
        for i in 0..20u8 {
            let value = store.write_chunk(ChunkType::DataLeaf, &[], &[i; 16]).unwrap();
            arr = array::prepend(&store, arr, value).unwrap();
        }
        assert!(store.segments().len() > 2);

        let boundary = Address::new(Layer::Durable, store.segments().last().unwrap().start());
        let stats = evacuate_below(&store, arr, boundary).unwrap();
        for addr in reachable(&store, stats.root).unwrap() {
            assert!(addr >= boundary, "{:?} left behind", addr);
        }

        store.drop_before(boundary).unwrap();
        let values: Vec<Vec<u8>> = array::iter(&store, stats.root)
            .unwrap()
            .map(|e| store.chunk(e.unwrap()).unwrap().decode().unwrap().data.to_vec())
            .collect();
        let expected: Vec<Vec<u8>> = (0..20u8).rev().map(|i| vec![i; 16]).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_evacuate_from_moves_recent_chunks() {
        let store = MemStore::new();
        let old = leaf(&store, b"old");
        let from = store.next_chunk_address();
        let new = leaf(&store, b"new");
        let root = store.write_chunk(ChunkType::ArrayLeaf, &[new, old], &[]).unwrap();

        let stats = evacuate(&store, root, from).unwrap();
        assert_eq!(stats.copied, 2);
        let refs = store.chunk(stats.root).unwrap().decode().unwrap().refs.to_vec();
        assert_eq!(refs[1], old);
        assert!(refs[0] > root);
    }
}
