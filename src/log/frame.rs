//! Length-prefixed and length-suffixed frames.
//!
//! ```text
//! +-----------+-----------------+-----------+
//! |len:u32    | chunk           |len:u32    |
//! +-----------+-----------------+-----------+
//! ```
//!
//! The duplicated length lets a scanner walk the log in both directions and
//! reject a torn tail: a frame is valid only if both lengths agree and the
//! enclosed bytes decode as a chunk.

use std::ops::Range;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::chunk::{Chunk, CHUNK_HEADER_LEN};
use crate::error::{Error, Result};

pub const FRAME_OVERHEAD: usize = 8;

pub fn frame_len(chunk_len: usize) -> usize {
    chunk_len + FRAME_OVERHEAD
}

/// Appends the frame of `chunk` to `buf`.
pub fn push_frame(buf: &mut Vec<u8>, chunk: &[u8]) -> Result<()> {
    let len = u32::try_from(chunk.len()).map_err(|_| Error::ChunkTooLarge(chunk.len()))?;
    buf.reserve(frame_len(chunk.len()));
    buf.write_u32::<BigEndian>(len)?;
    buf.extend_from_slice(chunk);
    buf.write_u32::<BigEndian>(len)?;
    Ok(())
}

/// Chunk range of the frame starting at `at`, if it is complete and valid.
pub fn frame_at(bytes: &[u8], at: usize) -> Option<Range<usize>> {
    let prefix = bytes.get(at..at.checked_add(4)?)?;
    let len = BigEndian::read_u32(prefix) as usize;
    let start = at + 4;
    let end = start.checked_add(len)?;
    let suffix = bytes.get(end..end.checked_add(4)?)?;
    if BigEndian::read_u32(suffix) as usize != len || len < CHUNK_HEADER_LEN {
        return None;
    }
    Chunk::decode(&bytes[start..end]).ok()?;
    Some(start..end)
}

/// Chunk range of the frame ending at `end`, if it is complete and valid.
pub fn frame_before(bytes: &[u8], end: usize) -> Option<Range<usize>> {
    let suffix_at = end.checked_sub(4)?;
    let len = BigEndian::read_u32(bytes.get(suffix_at..end)?) as usize;
    let at = suffix_at.checked_sub(len)?.checked_sub(4)?;
    let range = frame_at(bytes, at)?;
    if range.end != suffix_at {
        return None;
    }
    Some(range)
}

/// Forward scan over the frames of a byte slice.
///
/// Yields `(frame_offset, chunk_range)` and stops at the first invalid frame;
/// `valid_len` then tells where the valid prefix ends.
pub struct Frames<'a> {
    bytes: &'a [u8],
    pos: usize,
    end: usize,
    failed: bool,
}

impl<'a> Frames<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            end: bytes.len(),
            failed: false,
        }
    }

    /// Offset just past the last frame yielded so far.
    pub fn valid_len(&self) -> usize {
        self.pos
    }

    /// True once the scan stopped on bytes that are not a frame.
    pub fn hit_garbage(&self) -> bool {
        self.failed
    }
}

impl Iterator for Frames<'_> {
    type Item = (usize, Range<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.end {
            return None;
        }
        match frame_at(&self.bytes[..self.end], self.pos) {
            Some(range) => {
                let at = self.pos;
                self.pos = range.end + 4;
                Some((at, range))
            }
            None => {
                self.failed = true;
                None
            }
        }
    }
}

/// Backward scan over the frames of a byte slice, newest first.
pub struct FramesRev<'a> {
    bytes: &'a [u8],
    end: usize,
    failed: bool,
}

impl<'a> FramesRev<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            end: bytes.len(),
            failed: false,
        }
    }

    pub fn hit_garbage(&self) -> bool {
        self.failed
    }
}

impl Iterator for FramesRev<'_> {
    type Item = (usize, Range<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.end == 0 {
            return None;
        }
        match frame_before(self.bytes, self.end) {
            Some(range) => {
                let at = range.start - 4;
                self.end = at;
                Some((at, range))
            }
            None => {
                self.failed = true;
                None
            }
        }
    }
}
