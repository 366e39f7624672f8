use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::{check_refs, ChunkBytes, ChunkReader, ChunkWriter};
use crate::chunk::{Address, Layer};
use crate::error::{Error, Result};
use crate::log::frame::frame_len;

/// Heap-backed chunk store.
///
/// Addresses advance by frame length exactly as in a segment file, so code
/// built against it sees the same address arithmetic as on disk.
#[derive(Debug)]
pub struct MemStore {
    layer: Layer,
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    chunks: BTreeMap<u64, Arc<[u8]>>,
    next: u64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_layer(Layer::Durable)
    }

    pub fn with_layer(layer: Layer) -> Self {
        Self {
            layer,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn next_chunk_address(&self) -> Address {
        let next = self.inner.read().map(|i| i.next).unwrap_or(0);
        Address::new(self.layer, next)
    }

    /// Number of chunks stored.
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.chunks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every chunk in append order.
    pub fn chunks(&self) -> Vec<(Address, ChunkBytes)> {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(_) => return Vec::new(),
        };
        inner
            .chunks
            .iter()
            .map(|(offset, bytes)| {
                (
                    Address::new(self.layer, *offset),
                    ChunkBytes::from_heap(bytes.clone()),
                )
            })
            .collect()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkReader for MemStore {
    fn chunk(&self, addr: Address) -> Result<ChunkBytes> {
        if addr.layer() != Some(self.layer) {
            return Err(Error::InvalidChunk(format!(
                "{:?} is outside the {:?} layer",
                addr, self.layer
            )));
        }
        let inner = self.inner.read()?;
        inner
            .chunks
            .get(&addr.offset())
            .map(|bytes| ChunkBytes::from_heap(bytes.clone()))
            .ok_or_else(|| Error::InvalidChunk(format!("no chunk at {:?}", addr)))
    }
}

impl ChunkWriter for MemStore {
    fn append(&self, chunk: &[u8]) -> Result<Address> {
        let mut inner = self.inner.write()?;
        check_refs(chunk, self.layer, Address::new(self.layer, inner.next))?;
        let offset = inner.next;
        inner.chunks.insert(offset, Arc::from(chunk));
        inner.next += frame_len(chunk.len()) as u64;
        Ok(Address::new(self.layer, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkType;

    #[test]
    fn test_addresses_follow_frame_lengths() {
        let store = MemStore::new();
        let a = store.write_chunk(ChunkType::DataLeaf, &[], b"abc").unwrap();
        let b = store.write_chunk(ChunkType::ArrayLeaf, &[a], &[]).unwrap();

        assert_eq!(a, Address::new(Layer::Durable, 0));
        assert_eq!(b.offset(), frame_len(4 + 3) as u64);
        assert_eq!(store.len(), 2);

        let chunk = store.chunk(b).unwrap();
        assert_eq!(chunk.decode().unwrap().refs.to_vec(), vec![a]);
    }

    #[test]
    fn test_rejects_forward_reference() {
        let store = MemStore::new();
        let bogus = Address::new(Layer::Durable, 4096);
        assert!(store.write_chunk(ChunkType::ArrayLeaf, &[bogus], &[]).is_err());
        assert!(store.chunk(bogus).is_err());
    }
}
