//! Finds the last committed root of a durable store after an unclean stop.
//!
//! The fast path reads the final frame of the last non-empty segment: if it is
//! a commit, nothing was lost. Otherwise segments are scanned forward from the
//! newest one backwards until a segment holding a commit is found. Everything
//! after that commit (the rest of its segment and every later segment) is
//! discarded.

use crate::chunk::{Address, Chunk, ChunkType, Layer, COMMIT_FRAME_LEN};
use crate::error::{Error, Result};
use crate::log::frame;
use crate::log::segment::SegmentFile;
use crate::log::store::SegmentStore;
use crate::store::ChunkReader;

/// Outcome of [`recover`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recovered {
    /// Root named by the last valid commit, if any commit survived.
    pub root: Option<Address>,
    /// Bytes discarded from the tail of the log.
    pub discarded: u64,
}

fn commit_root(chunk: &[u8], commit_addr: Address) -> Option<Address> {
    let commit = Chunk::decode_as(chunk, ChunkType::Commit).ok()?;
    if commit.refs.len() != 1 || !commit.data.is_empty() {
        return None;
    }
    let root = commit.refs.get(0)?;
    if root.layer() != Some(Layer::Durable) || root >= commit_addr {
        return None;
    }
    Some(root)
}

/// Root of the commit frame that ends exactly at the segment's tail.
fn tail_commit(segment: &SegmentFile) -> Option<Address> {
    let bytes = segment.bytes();
    if bytes.len() < COMMIT_FRAME_LEN {
        return None;
    }
    let range = frame::frame_before(bytes, bytes.len())?;
    if range.len() + frame::FRAME_OVERHEAD != COMMIT_FRAME_LEN {
        return None;
    }
    let at = Address::new(Layer::Durable, segment.start() + (range.start - 4) as u64);
    commit_root(&bytes[range], at)
}

/// Last commit in the valid prefix of a segment, with the offset just past it.
fn last_commit_in(segment: &SegmentFile) -> Option<(Address, u64)> {
    let bytes = segment.bytes();
    let mut found = None;
    for (at, range) in segment.frames() {
        let addr = Address::new(Layer::Durable, segment.start() + at as u64);
        if let Some(root) = commit_root(&bytes[range.clone()], addr) {
            found = Some((root, (range.end + 4) as u64));
        }
    }
    found
}

fn root_is_readable(store: &SegmentStore, root: Address) -> bool {
    store
        .chunk(root)
        .and_then(|c| c.decode().map(|c| c.kind.is_entity()))
        .unwrap_or(false)
}

/// Restores `store` to its last commit.
pub fn recover(store: &SegmentStore) -> Result<Recovered> {
    let segments = store.segments();

    if let Some(last) = segments.iter().rev().find(|s| !s.is_empty()) {
        if let Some(root) = tail_commit(last) {
            if root_is_readable(store, root) {
                tracing::debug!(root = %root, "Log ends on a commit");
                return Ok(Recovered {
                    root: Some(root),
                    discarded: 0,
                });
            }
        }
    }

    let mut discarded = 0;
    for (index, segment) in segments.iter().enumerate().rev() {
        let found = last_commit_in(segment).filter(|(root, _)| root_is_readable(store, *root));
        match found {
            Some((root, end)) => {
                discarded += segment.len() - end;
                segment.truncate(end)?;
                store.discard_after(index)?;
                tracing::warn!(
                    root = %root,
                    discarded_bytes = discarded,
                    "Recovered log to last commit"
                );
                return Ok(Recovered {
                    root: Some(root),
                    discarded,
                });
            }
            None if index > 0 => {
                discarded += segment.len();
            }
            None => {
                if segment.start() > 0 {
                    return Err(Error::TruncatedLog(format!(
                        "no commit survives in {} and earlier segments were dropped",
                        segment.path().display()
                    )));
                }
                discarded += segment.len();
                segment.truncate(0)?;
                store.discard_after(0)?;
                if discarded > 0 {
                    tracing::warn!(discarded_bytes = discarded, "Log holds no commit, starting empty");
                }
                return Ok(Recovered {
                    root: None,
                    discarded,
                });
            }
        }
    }

    Err(Error::Corruption("segment store has no segments".to_string()))
}
