//! The seam between the persistent data structures and the log.
//!
//! Maps, arrays, data blobs, the navigator and the collector are written
//! against [`ChunkReader`] and [`ChunkWriter`] and never see segment files.
//! The segmented log, a transaction's layered view and [`MemStore`] implement
//! them.

pub mod mem;

pub use mem::MemStore;

use std::ops::{Deref, Range};
use std::sync::Arc;

use crate::chunk::{self, Address, Chunk, ChunkType, Layer};
use crate::error::{Error, Result};
use crate::log::segment::SegmentFile;

/// Read access to chunks by address.
pub trait ChunkReader {
    /// Returns the packed chunk stored at `addr` (without its frame).
    fn chunk(&self, addr: Address) -> Result<ChunkBytes>;
}

/// Append access. Appends take `&self`; implementations serialise internally.
pub trait ChunkWriter: ChunkReader {
    /// Appends a packed chunk and returns its address.
    fn append(&self, chunk: &[u8]) -> Result<Address>;

    /// Packs and appends in one step.
    fn write_chunk(&self, kind: ChunkType, refs: &[Address], data: &[u8]) -> Result<Address> {
        let bytes = chunk::pack(kind, refs, data)?;
        self.append(&bytes)
    }

    /// Appends several chunks. References are checked against the address
    /// the batch starts at, so chunks of one batch cannot refer to each other.
    fn append_batch(&self, chunks: &[Vec<u8>]) -> Result<Vec<Address>> {
        chunks.iter().map(|c| self.append(c)).collect()
    }

    /// Makes everything appended so far durable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl<T: ChunkReader + ?Sized> ChunkReader for &T {
    fn chunk(&self, addr: Address) -> Result<ChunkBytes> {
        (**self).chunk(addr)
    }
}

impl<T: ChunkWriter + ?Sized> ChunkWriter for &T {
    fn append(&self, chunk: &[u8]) -> Result<Address> {
        (**self).append(chunk)
    }

    fn append_batch(&self, chunks: &[Vec<u8>]) -> Result<Vec<Address>> {
        (**self).append_batch(chunks)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

impl<T: ChunkReader + ?Sized> ChunkReader for Arc<T> {
    fn chunk(&self, addr: Address) -> Result<ChunkBytes> {
        (**self).chunk(addr)
    }
}

#[derive(Clone)]
enum Backing {
    Segment(Arc<SegmentFile>),
    Heap(Arc<[u8]>),
}

/// Packed chunk bytes that keep their backing storage alive.
///
/// A view into a segment pins the segment file: it stays mapped, and on disk,
/// until every view into it is gone.
#[derive(Clone)]
pub struct ChunkBytes {
    backing: Backing,
    range: Range<usize>,
}

impl ChunkBytes {
    pub(crate) fn in_segment(segment: Arc<SegmentFile>, range: Range<usize>) -> Self {
        Self {
            backing: Backing::Segment(segment),
            range,
        }
    }

    pub fn from_heap(bytes: Arc<[u8]>) -> Self {
        let range = 0..bytes.len();
        Self {
            backing: Backing::Heap(bytes),
            range,
        }
    }

    pub fn decode(&self) -> Result<Chunk<'_>> {
        Chunk::decode(self)
    }

    pub fn decode_as(&self, kind: ChunkType) -> Result<Chunk<'_>> {
        Chunk::decode_as(self, kind)
    }
}

impl Deref for ChunkBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.backing {
            Backing::Segment(segment) => segment.slice(self.range.clone()),
            Backing::Heap(bytes) => &bytes[self.range.clone()],
        }
    }
}

impl AsRef<[u8]> for ChunkBytes {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl std::fmt::Debug for ChunkBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBytes").field("len", &self.len()).finish()
    }
}

/// Checks that every reference of `chunk` may be stored by a writer of
/// `layer` whose next free address is `next`.
///
/// References inside the writer's own layer must point strictly backwards.
/// Only the scratch layer may point into another layer, and then only at
/// durable chunks.
pub fn check_refs(chunk: &[u8], layer: Layer, next: Address) -> Result<()> {
    let decoded = Chunk::decode(chunk)?;
    for r in decoded.refs.iter() {
        if r.is_nil() {
            continue;
        }
        match r.layer() {
            Some(l) if l == layer => {
                if r >= next {
                    return Err(Error::InvalidChunk(format!(
                        "reference {:?} does not point below {:?}",
                        r, next
                    )));
                }
            }
            Some(Layer::Durable) if layer == Layer::Scratch => {}
            _ => {
                return Err(Error::InvalidChunk(format!(
                    "reference {:?} crosses into a layer a {:?} chunk may not see",
                    r, layer
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_refs_rules() {
        let next = Address::new(Layer::Durable, 100);
        let ok = chunk::pack(
            ChunkType::ArrayLeaf,
            &[Address::new(Layer::Durable, 10), Address::NIL],
            &[],
        )
        .unwrap();
        assert!(check_refs(&ok, Layer::Durable, next).is_ok());

        let forward = chunk::pack(ChunkType::ArrayLeaf, &[Address::new(Layer::Durable, 100)], &[])
            .unwrap();
        assert!(check_refs(&forward, Layer::Durable, next).is_err());

        let into_scratch =
            chunk::pack(ChunkType::ArrayLeaf, &[Address::new(Layer::Scratch, 0)], &[]).unwrap();
        assert!(check_refs(&into_scratch, Layer::Durable, next).is_err());

        let scratch_next = Address::new(Layer::Scratch, 50);
        let into_durable =
            chunk::pack(ChunkType::ArrayLeaf, &[Address::new(Layer::Durable, 5000)], &[]).unwrap();
        assert!(check_refs(&into_durable, Layer::Scratch, scratch_next).is_ok());
    }
}
