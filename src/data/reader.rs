use std::io;

use super::Header;
use crate::chunk::{Address, ChunkType};
use crate::error::{Error, Result};
use crate::store::{ChunkBytes, ChunkReader};

struct Level {
    node: ChunkBytes,
    next: usize,
}

/// Streams a data tree back as bytes.
///
/// Keeps the chain of headers from the root to the current leaf together with
/// the next child to visit at each of them.
pub struct DataReader<R> {
    store: R,
    root: Address,
    size: u64,
    pos: u64,
    stack: Vec<Level>,
    leaf: Option<(ChunkBytes, usize)>,
}

impl<R: ChunkReader> DataReader<R> {
    pub fn new(store: R, root: Address) -> Result<Self> {
        let size = super::size(&store, root)?;
        let mut reader = Self {
            store,
            root,
            size,
            pos: 0,
            stack: Vec::new(),
            leaf: None,
        };
        reader.descend(root)?;
        Ok(reader)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current byte offset.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Walks down the leftmost edge from `addr` to a leaf.
    fn descend(&mut self, mut addr: Address) -> Result<()> {
        loop {
            let node = self.store.chunk(addr)?;
            let chunk = node.decode()?;
            match chunk.kind {
                ChunkType::DataLeaf => {
                    self.leaf = Some((node, 0));
                    return Ok(());
                }
                ChunkType::DataHeader => {
                    Header::parse(&chunk)?;
                    addr = chunk.refs.get(0).ok_or(Error::NotData)?;
                    self.stack.push(Level { node, next: 1 });
                }
                _ => return Err(Error::NotData),
            }
        }
    }

    /// Moves to the next leaf; false at the end of the blob.
    fn next_leaf(&mut self) -> Result<bool> {
        self.leaf = None;
        while let Some(level) = self.stack.last_mut() {
            let chunk = level.node.decode()?;
            if let Some(child) = chunk.refs.get(level.next) {
                level.next += 1;
                self.descend(child)?;
                return Ok(true);
            }
            self.stack.pop();
        }
        Ok(false)
    }

    /// Positions the reader at byte `offset`; offsets past the end clamp to it.
    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.stack.clear();
        self.leaf = None;
        if offset >= self.size {
            self.pos = self.size;
            return Ok(());
        }

        let mut addr = self.root;
        let mut remaining = offset;
        loop {
            let node = self.store.chunk(addr)?;
            let chunk = node.decode()?;
            match chunk.kind {
                ChunkType::DataLeaf => {
                    if remaining > chunk.data.len() as u64 {
                        return Err(short_leaf(addr, chunk.data.len(), remaining));
                    }
                    self.leaf = Some((node, remaining as usize));
                    break;
                }
                ChunkType::DataHeader => {
                    let header = Header::parse(&chunk)?;
                    let mut index = 0;
                    while index < chunk.refs.len() && remaining >= header.child_size(index) {
                        remaining -= header.child_size(index);
                        index += 1;
                    }
                    addr = match chunk.refs.get(index) {
                        Some(child) => child,
                        None => {
                            return Err(Error::InvalidChunk(format!(
                                "data header at {:?} holds {} bytes, less than its parent records",
                                addr, header.total
                            )))
                        }
                    };
                    self.stack.push(Level { node, next: index + 1 });
                }
                _ => return Err(Error::NotData),
            }
        }
        self.pos = offset;
        Ok(())
    }
}

fn short_leaf(addr: Address, len: usize, offset: u64) -> Error {
    Error::InvalidChunk(format!(
        "data leaf under {:?} holds {} bytes, offset {} is past its end",
        addr, len, offset
    ))
}

impl<R: ChunkReader> io::Read for DataReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some((node, at)) = &mut self.leaf {
                let chunk = node.decode()?;
                let rest = chunk
                    .data
                    .get(*at..)
                    .ok_or_else(|| short_leaf(self.root, chunk.data.len(), *at as u64))?;
                if !rest.is_empty() {
                    let n = rest.len().min(buf.len());
                    buf[..n].copy_from_slice(&rest[..n]);
                    *at += n;
                    self.pos += n as u64;
                    return Ok(n);
                }
            }
            if !self.next_leaf()? {
                return Ok(0);
            }
        }
    }
}

impl<R: ChunkReader> io::Seek for DataReader<R> {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(offset) => Some(offset),
            io::SeekFrom::End(delta) => self.size.checked_add_signed(delta),
            io::SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before the start of the blob")
        })?;
        self.seek_to(target)?;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::write_all;
    use crate::store::{ChunkWriter, MemStore};
    use std::io::{Read, Seek, SeekFrom};

    fn blob(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_small_reads_cross_leaves() {
        let store = MemStore::new();
        let bytes = blob(100);
        let root = write_all(&store, &bytes, 7, 3).unwrap();

        let mut reader = DataReader::new(&store, root).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 5];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, bytes);
        assert_eq!(reader.position(), 100);
    }

    #[test]
    fn test_seek_to_every_offset() {
        let store = MemStore::new();
        let bytes = blob(57);
        let root = write_all(&store, &bytes, 4, 2).unwrap();

        let mut reader = DataReader::new(&store, root).unwrap();
        for offset in 0..=57u64 {
            reader.seek(SeekFrom::Start(offset)).unwrap();
            let mut rest = Vec::new();
            reader.read_to_end(&mut rest).unwrap();
            assert_eq!(rest, &bytes[offset as usize..], "offset {}", offset);
        }
    }

    #[test]
    fn test_seek_relative() {
        let store = MemStore::new();
        let bytes = blob(40);
        let root = write_all(&store, &bytes, 6, 2).unwrap();

        let mut reader = DataReader::new(&store, root).unwrap();
        assert_eq!(reader.seek(SeekFrom::End(-3)).unwrap(), 37);
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &bytes[37..]);

        reader.seek(SeekFrom::Start(10)).unwrap();
        assert_eq!(reader.seek(SeekFrom::Current(5)).unwrap(), 15);
        assert!(reader.seek(SeekFrom::Current(-100)).is_err());
        assert_eq!(reader.seek(SeekFrom::Start(1000)).unwrap(), 40);
    }

    fn header(store: &MemStore, children: &[(Address, u64)]) -> Address {
        let total: u64 = children.iter().map(|(_, size)| size).sum();
        let mut payload = total.to_be_bytes().to_vec();
        for (_, size) in children {
            payload.extend_from_slice(&size.to_be_bytes());
        }
        let refs: Vec<Address> = children.iter().map(|(addr, _)| *addr).collect();
        store.write_chunk(ChunkType::DataHeader, &refs, &payload).unwrap()
    }

    #[test]
    fn test_seek_into_leaf_shorter_than_recorded() {
        let store = MemStore::new();
        let short = store.write_chunk(ChunkType::DataLeaf, &[], b"abcd").unwrap();
        let full = store.write_chunk(ChunkType::DataLeaf, &[], b"efghij").unwrap();
        let root = header(&store, &[(short, 10), (full, 6)]);

        let mut reader = DataReader::new(&store, root).unwrap();
        assert!(matches!(reader.seek_to(7), Err(Error::InvalidChunk(_))));
        reader.seek_to(12).unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"ghij");
    }

    #[test]
    fn test_seek_into_header_smaller_than_recorded() {
        let store = MemStore::new();
        let leaf = store.write_chunk(ChunkType::DataLeaf, &[], b"abcd").unwrap();
        let inner = header(&store, &[(leaf, 4)]);
        let root = header(&store, &[(inner, 10)]);

        let mut reader = DataReader::new(&store, root).unwrap();
        assert!(matches!(reader.seek_to(6), Err(Error::InvalidChunk(_))));
        assert_eq!(
            reader.seek(SeekFrom::Start(6)).unwrap_err().kind(),
            std::io::ErrorKind::Other
        );
    }
}
