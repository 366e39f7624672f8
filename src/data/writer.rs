use std::io;

use byteorder::{BigEndian, WriteBytesExt};

use crate::chunk::{Address, ChunkType};
use crate::error::Result;
use crate::store::ChunkWriter;

/// Streams bytes into a data tree.
///
/// Leaves are written as soon as `leaf_size` bytes have accumulated. Each
/// level keeps a bounded list of finished fragments; when a list reaches
/// `fanout` entries it is written as a header that becomes one fragment of
/// the level above.
pub struct DataWriter<W> {
    store: W,
    leaf_size: usize,
    fanout: usize,
    buf: Vec<u8>,
    levels: Vec<Vec<(Address, u64)>>,
    written: u64,
}

impl<W: ChunkWriter> DataWriter<W> {
    pub fn new(store: W, leaf_size: usize, fanout: usize) -> Self {
        let leaf_size = leaf_size.max(1);
        Self {
            store,
            leaf_size,
            fanout: fanout.max(2),
            buf: Vec::with_capacity(leaf_size),
            levels: Vec::new(),
            written: 0,
        }
    }

    /// Bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn append(&mut self, mut bytes: &[u8]) -> Result<()> {
        self.written += bytes.len() as u64;
        while !bytes.is_empty() {
            let take = (self.leaf_size - self.buf.len()).min(bytes.len());
            self.buf.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.buf.len() == self.leaf_size {
                self.emit_leaf()?;
            }
        }
        Ok(())
    }

    fn emit_leaf(&mut self) -> Result<()> {
        let addr = self.store.write_chunk(ChunkType::DataLeaf, &[], &self.buf)?;
        let size = self.buf.len() as u64;
        self.buf.clear();
        self.push_fragment(0, addr, size)
    }

    fn push_fragment(&mut self, level: usize, addr: Address, size: u64) -> Result<()> {
        if self.levels.len() <= level {
            self.levels.push(Vec::with_capacity(self.fanout));
        }
        self.levels[level].push((addr, size));
        if self.levels[level].len() == self.fanout {
            let fragments = std::mem::take(&mut self.levels[level]);
            let (header, total) = self.write_header(&fragments)?;
            self.push_fragment(level + 1, header, total)?;
        }
        Ok(())
    }

    fn write_header(&self, fragments: &[(Address, u64)]) -> Result<(Address, u64)> {
        let total: u64 = fragments.iter().map(|(_, size)| size).sum();
        let refs: Vec<Address> = fragments.iter().map(|(addr, _)| *addr).collect();
        let mut payload = Vec::with_capacity(8 + 8 * fragments.len());
        payload.write_u64::<BigEndian>(total)?;
        for (_, size) in fragments {
            payload.write_u64::<BigEndian>(*size)?;
        }
        let addr = self.store.write_chunk(ChunkType::DataHeader, &refs, &payload)?;
        Ok((addr, total))
    }

    /// Writes what is still buffered and returns the root of the blob.
    pub fn finish(mut self) -> Result<Address> {
        if !self.buf.is_empty() {
            self.emit_leaf()?;
        }

        // Lower levels hold the newest bytes, so a carried fragment always
        // goes after the fragments already waiting one level up.
        let mut carry: Option<(Address, u64)> = None;
        for level in 0..self.levels.len() {
            let mut fragments = std::mem::take(&mut self.levels[level]);
            fragments.extend(carry.take());
            carry = match fragments.len() {
                0 => None,
                1 => Some(fragments[0]),
                _ => Some(self.write_header(&fragments)?),
            };
        }

        match carry {
            Some((root, _)) => Ok(root),
            None => self.store.write_chunk(ChunkType::DataLeaf, &[], &[]),
        }
    }
}

impl<W: ChunkWriter> io::Write for DataWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChunkReader, MemStore};
    use std::io::Write;

    fn kinds(store: &MemStore) -> Vec<ChunkType> {
        store
            .chunks()
            .iter()
            .map(|(_, bytes)| bytes.decode().unwrap().kind)
            .collect()
    }

    #[test]
    fn test_leaves_are_written_eagerly() {
        let store = MemStore::new();
        let mut writer = DataWriter::new(&store, 4, 3);
        writer.write_all(b"abcdefghij").unwrap();
        assert_eq!(kinds(&store), vec![ChunkType::DataLeaf, ChunkType::DataLeaf]);
        assert_eq!(writer.written(), 10);

        writer.write_all(b"kl").unwrap();
        // Third leaf fills the level-0 aggregator.
        assert_eq!(
            kinds(&store),
            vec![
                ChunkType::DataLeaf,
                ChunkType::DataLeaf,
                ChunkType::DataLeaf,
                ChunkType::DataHeader
            ]
        );
    }

    #[test]
    fn test_finish_carries_lone_fragment() {
        let store = MemStore::new();
        let mut writer = DataWriter::new(&store, 2, 2);
        writer.write_all(&[0; 8]).unwrap();
        let root = writer.finish().unwrap();

        // 4 leaves, 2 level-1 headers and one level-2 header; finish adds nothing.
        assert_eq!(store.len(), 7);
        let bytes = store.chunk(root).unwrap();
        let chunk = bytes.decode().unwrap();
        assert_eq!(chunk.kind, ChunkType::DataHeader);
        assert_eq!(chunk.refs.len(), 2);
    }

    #[test]
    fn test_finish_appends_newest_fragment_last() {
        let store = MemStore::new();
        let mut writer = DataWriter::new(&store, 1, 3);
        writer.write_all(&[1, 2, 3, 4, 5]).unwrap();
        let root = writer.finish().unwrap();

        // [1,2,3] became a level-1 header; [4,5] is wrapped at finish and
        // carried after it.
        let bytes = store.chunk(root).unwrap();
        let chunk = bytes.decode().unwrap();
        assert_eq!(chunk.refs.len(), 2);
        let first = chunk.refs.get(0).unwrap();
        assert_eq!(super::super::size(&store, first).unwrap(), 3);
        assert_eq!(super::super::read_all(&store, root).unwrap(), vec![1, 2, 3, 4, 5]);
    }
}
