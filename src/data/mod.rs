//! Byte blobs stored as a tree of leaf and header chunks.
//!
//! # Chunk Layout
//!
//! ```text
//! DataLeaf    refs: none               payload: bytes
//! DataHeader  refs: child roots, ...   payload: total:u64 | size:u64 per child
//! ```
//!
//! A blob that fits in one leaf is a single `DataLeaf`. Larger blobs are a
//! `DataHeader` whose children are, in order, leaves or further headers. The
//! in-order concatenation of the leaves is the blob.

mod reader;
mod writer;

pub use reader::DataReader;
pub use writer::DataWriter;

use byteorder::{BigEndian, ByteOrder};

use crate::chunk::{Address, Chunk, ChunkType};
use crate::error::{Error, Result};
use crate::store::{ChunkReader, ChunkWriter};

/// Writes `bytes` as a new blob and returns its root.
pub fn write_all<W: ChunkWriter>(
    store: W,
    bytes: &[u8],
    leaf_size: usize,
    fanout: usize,
) -> Result<Address> {
    let mut writer = DataWriter::new(store, leaf_size, fanout);
    writer.append(bytes)?;
    writer.finish()
}

/// Total size in bytes of the blob rooted at `root`.
pub fn size<R: ChunkReader>(store: R, root: Address) -> Result<u64> {
    let bytes = store.chunk(root)?;
    let chunk = bytes.decode()?;
    match chunk.kind {
        ChunkType::DataLeaf => Ok(chunk.data.len() as u64),
        ChunkType::DataHeader => Ok(Header::parse(&chunk)?.total),
        _ => Err(Error::NotData),
    }
}

/// Reads the whole blob into memory.
pub fn read_all<R: ChunkReader>(store: R, root: Address) -> Result<Vec<u8>> {
    let mut reader = DataReader::new(store, root)?;
    let mut out = Vec::with_capacity(reader.size() as usize);
    std::io::Read::read_to_end(&mut reader, &mut out)?;
    Ok(out)
}

/// Checked view of a `DataHeader` payload.
pub(crate) struct Header<'a> {
    pub total: u64,
    sizes: &'a [u8],
}

impl<'a> Header<'a> {
    pub fn parse(chunk: &Chunk<'a>) -> Result<Self> {
        let expected = 8 + 8 * chunk.refs.len();
        if chunk.kind != ChunkType::DataHeader || chunk.data.len() != expected || chunk.refs.is_empty() {
            return Err(Error::InvalidChunk(format!(
                "data header with {} refs carries {} payload bytes",
                chunk.refs.len(),
                chunk.data.len()
            )));
        }
        let header = Self {
            total: BigEndian::read_u64(&chunk.data[..8]),
            sizes: &chunk.data[8..],
        };
        let sum: u64 = (0..chunk.refs.len()).map(|i| header.child_size(i)).sum();
        if sum != header.total {
            return Err(Error::InvalidChunk(format!(
                "data header total {} disagrees with child sizes summing to {}",
                header.total, sum
            )));
        }
        Ok(header)
    }

    pub fn child_size(&self, index: usize) -> u64 {
        BigEndian::read_u64(&self.sizes[index * 8..index * 8 + 8])
    }
}
