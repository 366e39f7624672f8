//! Typed chunks, the unit of storage of the log.
//!
//! # Wire Format
//!
//! ```text
//! +-----------+-------------+---------------------+-----------------+
//! | type:u16  |ref_count:u16| refs: u64*ref_count |     payload     |
//! +-----------+-------------+---------------------+-----------------+
//! ```
//!
//! All integers are big-endian. References are absolute [`Address`]es of
//! older chunks; the payload is opaque to this layer.

mod address;

pub use address::{Address, Layer};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::error::{Error, Result};

/// Size of the type and ref-count fields.
pub const CHUNK_HEADER_LEN: usize = 4;

/// Length of a framed commit chunk: prefix, type, ref count, one ref, suffix.
pub const COMMIT_FRAME_LEN: usize = 4 + CHUNK_HEADER_LEN + 8 + 4;

/// Chunk type codes. These values are stored on disk and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ChunkType {
    Error = 0,
    Commit = 1,
    DataLeaf = 10,
    DataHeader = 11,
    MapLeaf = 20,
    MapInternal = 21,
    ArrayLeaf = 30,
    ArrayNode = 31,
    WbbNode = 40,
}

impl ChunkType {
    pub fn from_code(code: u16) -> Option<Self> {
        let kind = match code {
            0 => ChunkType::Error,
            1 => ChunkType::Commit,
            10 => ChunkType::DataLeaf,
            11 => ChunkType::DataHeader,
            20 => ChunkType::MapLeaf,
            21 => ChunkType::MapInternal,
            30 => ChunkType::ArrayLeaf,
            31 => ChunkType::ArrayNode,
            40 => ChunkType::WbbNode,
            _ => return None,
        };
        Some(kind)
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// Types that can sit at the root of a map, array or data entity.
    pub fn is_entity(self) -> bool {
        matches!(
            self,
            ChunkType::WbbNode
                | ChunkType::ArrayLeaf
                | ChunkType::ArrayNode
                | ChunkType::DataLeaf
                | ChunkType::DataHeader
        )
    }
}

/// Packs a chunk into `buf`, which is cleared first.
pub fn pack_into(buf: &mut Vec<u8>, kind: ChunkType, refs: &[Address], data: &[u8]) -> Result<()> {
    if refs.len() > u16::MAX as usize {
        return Err(Error::InvalidChunk(format!(
            "{} references exceed the ref count field",
            refs.len()
        )));
    }
    buf.clear();
    buf.reserve(CHUNK_HEADER_LEN + refs.len() * 8 + data.len());
    buf.write_u16::<BigEndian>(kind.code())?;
    buf.write_u16::<BigEndian>(refs.len() as u16)?;
    for r in refs {
        buf.write_u64::<BigEndian>(r.raw())?;
    }
    buf.extend_from_slice(data);
    Ok(())
}

pub fn pack(kind: ChunkType, refs: &[Address], data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    pack_into(&mut buf, kind, refs, data)?;
    Ok(buf)
}

/// Borrowed view of a packed chunk.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub kind: ChunkType,
    pub refs: Refs<'a>,
    pub data: &'a [u8],
}

impl<'a> Chunk<'a> {
    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < CHUNK_HEADER_LEN {
            return Err(Error::InvalidChunk(format!(
                "{} bytes is shorter than a chunk header",
                bytes.len()
            )));
        }
        let code = BigEndian::read_u16(&bytes[0..2]);
        let kind = ChunkType::from_code(code)
            .ok_or_else(|| Error::InvalidChunk(format!("unknown chunk type {}", code)))?;
        let ref_count = BigEndian::read_u16(&bytes[2..4]) as usize;
        let refs_end = CHUNK_HEADER_LEN + ref_count * 8;
        if refs_end > bytes.len() {
            return Err(Error::InvalidChunk(format!(
                "{} references do not fit in {} bytes",
                ref_count,
                bytes.len()
            )));
        }
        Ok(Self {
            kind,
            refs: Refs(&bytes[CHUNK_HEADER_LEN..refs_end]),
            data: &bytes[refs_end..],
        })
    }

    /// Decodes and checks the type in one step.
    pub fn decode_as(bytes: &'a [u8], expected: ChunkType) -> Result<Self> {
        let chunk = Self::decode(bytes)?;
        if chunk.kind != expected {
            return Err(Error::InvalidChunk(format!(
                "expected {:?} chunk, found {:?}",
                expected, chunk.kind
            )));
        }
        Ok(chunk)
    }
}

/// References of a chunk, read in place.
#[derive(Debug, Clone, Copy)]
pub struct Refs<'a>(&'a [u8]);

impl<'a> Refs<'a> {
    pub fn len(&self) -> usize {
        self.0.len() / 8
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Address> {
        let start = index.checked_mul(8)?;
        let bytes = self.0.get(start..start + 8)?;
        Some(Address::from_raw(BigEndian::read_u64(bytes)))
    }

    pub fn iter(&self) -> impl Iterator<Item = Address> + 'a {
        let bytes: &'a [u8] = self.0;
        bytes
            .chunks_exact(8)
            .map(|b| Address::from_raw(BigEndian::read_u64(b)))
    }

    pub fn to_vec(&self) -> Vec<Address> {
        self.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_decode() {
        let refs = [
            Address::new(Layer::Durable, 8),
            Address::NIL,
            Address::new(Layer::Scratch, 99),
        ];
        let bytes = pack(ChunkType::WbbNode, &refs, b"payload").unwrap();
        assert_eq!(bytes.len(), CHUNK_HEADER_LEN + 3 * 8 + 7);
        assert_eq!(&bytes[0..2], &[0, 40]);

        let chunk = Chunk::decode(&bytes).unwrap();
        assert_eq!(chunk.kind, ChunkType::WbbNode);
        assert_eq!(chunk.refs.to_vec(), refs.to_vec());
        assert_eq!(chunk.refs.get(1), Some(Address::NIL));
        assert_eq!(chunk.refs.get(3), None);
        assert_eq!(chunk.data, b"payload");
    }

    #[test]
    fn test_commit_chunk_length() {
        let bytes = pack(ChunkType::Commit, &[Address::new(Layer::Durable, 0)], &[]).unwrap();
        assert_eq!(bytes.len() + 8, COMMIT_FRAME_LEN);
        assert_eq!(COMMIT_FRAME_LEN, 20);
    }

    #[test]
    fn test_decode_rejects_short_and_unknown() {
        assert!(matches!(Chunk::decode(&[0, 1]), Err(Error::InvalidChunk(_))));
        assert!(matches!(Chunk::decode(&[0, 99, 0, 0]), Err(Error::InvalidChunk(_))));

        // Claims two references but carries one.
        let mut bytes = pack(ChunkType::ArrayLeaf, &[Address::NIL], &[]).unwrap();
        bytes[3] = 2;
        assert!(matches!(Chunk::decode(&bytes), Err(Error::InvalidChunk(_))));
    }

    #[test]
    fn test_decode_as_checks_type() {
        let bytes = pack(ChunkType::DataLeaf, &[], b"x").unwrap();
        assert!(Chunk::decode_as(&bytes, ChunkType::DataLeaf).is_ok());
        assert!(Chunk::decode_as(&bytes, ChunkType::ArrayLeaf).is_err());
    }

    #[test]
    fn test_pack_into_reuses_buffer() {
        let mut buf = vec![1, 2, 3, 4, 5, 6, 7, 8, 9];
        pack_into(&mut buf, ChunkType::ArrayLeaf, &[], &[]).unwrap();
        assert_eq!(buf, vec![0, 30, 0, 0]);
    }
}
