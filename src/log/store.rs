//! A virtual append-only space composed of numbered segment files.
//!
//! Each file is named after the offset of its first byte in the virtual
//! space, as 16 lowercase hex digits. The last file is the current one; every
//! earlier file is full and never written again. Addresses stay valid across
//! rotations because a file's start offset never changes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use itertools::Itertools;

use super::frame::{self, push_frame};
use super::segment::SegmentFile;
use crate::chunk::{Address, Layer};
use crate::error::{Error, Result};
use crate::store::{check_refs, ChunkBytes, ChunkReader, ChunkWriter};

pub const SEGMENT_EXTENSION: &str = "seg";
pub const SCRATCH_EXTENSION: &str = "scratch";

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub max_segment_size: u64,
    pub growth_step: u64,
    pub extension: &'static str,
}

impl StoreOptions {
    pub fn new(max_segment_size: u64, growth_step: u64) -> Self {
        Self {
            max_segment_size,
            growth_step,
            extension: SEGMENT_EXTENSION,
        }
    }

    pub fn extension(mut self, extension: &'static str) -> Self {
        self.extension = extension;
        self
    }
}

pub fn segment_file_name(start: u64, extension: &str) -> String {
    format!("{:016x}.{}", start, extension)
}

fn parse_segment_start(path: &Path, extension: &str) -> Option<u64> {
    if path.extension()?.to_str()? != extension {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.len() != 16 {
        return None;
    }
    u64::from_str_radix(stem, 16).ok()
}

/// Lists `(start, path)` of the segment files in `dir`, ascending.
pub fn list_segments(dir: &Path, extension: &str) -> Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(start) = parse_segment_start(&path, extension) {
            found.push((start, path));
        }
    }
    Ok(found.into_iter().sorted_by_key(|(start, _)| *start).collect())
}

pub struct SegmentStore {
    dir: PathBuf,
    layer: Layer,
    options: StoreOptions,
    segments: RwLock<Vec<Arc<SegmentFile>>>,
    append_lock: Mutex<()>,
}

impl std::fmt::Debug for SegmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentStore")
            .field("dir", &self.dir)
            .field("layer", &self.layer)
            .field("extension", &self.options.extension)
            .finish()
    }
}

impl SegmentStore {
    /// Opens every segment of `dir`, creating the first one if there is none.
    pub fn open(dir: impl Into<PathBuf>, layer: Layer, options: StoreOptions) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut segments = Vec::new();
        for (start, path) in list_segments(&dir, options.extension)? {
            let segment = SegmentFile::open(
                path,
                start,
                options.max_segment_size,
                options.growth_step,
                false,
            )?;
            segments.push(Arc::new(segment));
        }

        // A dropped segment is unlinked when its last reader lets go, so an
        // older dropped file can outlive a newer one. Live segments are always
        // contiguous up to the current one: everything before the last gap
        // was dropped, and the commit that dropped it lies after the gap.
        let mut first_live = 0;
        for (i, (prev, next)) in segments.iter().tuple_windows().enumerate() {
            if prev.end() > next.start() {
                return Err(Error::Corruption(format!(
                    "segment {} ends at {:#x} but {} starts at {:#x}",
                    prev.path().display(),
                    prev.end(),
                    next.path().display(),
                    next.start()
                )));
            }
            if prev.end() < next.start() {
                first_live = i + 1;
            }
        }
        for stale in segments.drain(..first_live) {
            tracing::warn!(
                path = %stale.path().display(),
                "Removing segment dropped by an earlier compaction"
            );
            stale.mark_for_deletion();
        }

        if segments.is_empty() {
            let path = dir.join(segment_file_name(0, options.extension));
            let segment =
                SegmentFile::open(path, 0, options.max_segment_size, options.growth_step, true)?;
            segments.push(Arc::new(segment));
        }

        tracing::debug!(
            dir = %dir.display(),
            layer = ?layer,
            segments = segments.len(),
            "Opened segment store"
        );

        Ok(Self {
            dir,
            layer,
            options,
            segments: RwLock::new(segments),
            append_lock: Mutex::new(()),
        })
    }

    /// Opens an empty store, deleting any files a previous owner left behind.
    pub fn create_fresh(dir: impl Into<PathBuf>, layer: Layer, options: StoreOptions) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        for (_, path) in list_segments(&dir, options.extension)? {
            tracing::debug!(path = %path.display(), "Removing stale segment file");
            std::fs::remove_file(path)?;
        }
        Self::open(dir, layer, options)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    /// Snapshot of the open segments, oldest first.
    pub fn segments(&self) -> Vec<Arc<SegmentFile>> {
        self.segments
            .read()
            .map(|segments| segments.clone())
            .unwrap_or_default()
    }

    /// Read-only view pinned to the segments open right now.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            layer: self.layer,
            segments: self.segments(),
        }
    }

    fn current(&self) -> Result<Arc<SegmentFile>> {
        let segments = self.segments.read()?;
        segments
            .last()
            .cloned()
            .ok_or_else(|| Error::Corruption("segment store has no segments".to_string()))
    }

    /// Address at which the next append will start.
    pub fn next_chunk_address(&self) -> Result<Address> {
        Ok(Address::new(self.layer, self.current()?.end()))
    }

    /// Closes the current segment and starts a new one right after it.
    fn rotate(&self, current: &SegmentFile) -> Result<Arc<SegmentFile>> {
        current.close()?;
        let start = current.end();
        let path = self.dir.join(segment_file_name(start, self.options.extension));
        let segment = Arc::new(SegmentFile::open(
            path,
            start,
            self.options.max_segment_size,
            self.options.growth_step,
            true,
        )?);
        self.segments.write()?.push(segment.clone());
        tracing::debug!(
            layer = ?self.layer,
            start = format_args!("{:#x}", start),
            "Rotated to new segment"
        );
        Ok(segment)
    }

    /// Current segment, rotated first if `frame_len` more bytes do not fit.
    fn segment_for(&self, frame_len: u64) -> Result<Arc<SegmentFile>> {
        if frame_len > self.options.max_segment_size {
            return Err(Error::ChunkTooLarge(frame_len as usize));
        }
        let current = self.current()?;
        if current.len() + frame_len > current.max_size() {
            return self.rotate(&current);
        }
        Ok(current)
    }

    /// Appends all chunks, with one write per segment touched.
    pub fn bulk_append<C: AsRef<[u8]>>(&self, chunks: &[C]) -> Result<Vec<Address>> {
        let _guard = self.append_lock.lock()?;
        let mut addresses = Vec::with_capacity(chunks.len());
        let mut buf = Vec::new();
        let mut segment = self.current()?;
        let base = Address::new(self.layer, segment.end());

        for chunk in chunks {
            let chunk = chunk.as_ref();
            check_refs(chunk, self.layer, base)?;
            let frame_len = frame::frame_len(chunk.len()) as u64;
            if segment.len() + buf.len() as u64 + frame_len > segment.max_size() {
                if !buf.is_empty() {
                    segment.append(&buf)?;
                    buf.clear();
                }
                segment = self.segment_for(frame_len)?;
            }
            addresses.push(Address::new(
                self.layer,
                segment.end() + buf.len() as u64,
            ));
            push_frame(&mut buf, chunk)?;
        }
        if !buf.is_empty() {
            segment.append(&buf)?;
        }
        Ok(addresses)
    }

    pub fn flush(&self) -> Result<()> {
        self.current()?.flush()
    }

    /// Trims growth padding off the current segment.
    pub fn close(&self) -> Result<()> {
        self.current()?.close()
    }

    /// Deletes every full segment that ends at or before `addr`. Files still
    /// pinned by readers are unlinked when the last reader lets go.
    pub fn drop_before(&self, addr: Address) -> Result<usize> {
        let _guard = self.append_lock.lock()?;
        let mut segments = self.segments.write()?;
        let full = segments.len().saturating_sub(1);
        let doomed = segments[..full]
            .iter()
            .take_while(|s| s.end() <= addr.offset())
            .count();
        for segment in segments.drain(..doomed) {
            tracing::debug!(
                path = %segment.path().display(),
                end = format_args!("{:#x}", segment.end()),
                "Dropping segment"
            );
            segment.mark_for_deletion();
        }
        Ok(doomed)
    }

    /// Deletes every segment file of this store.
    pub fn destroy(&self) -> Result<()> {
        let _guard = self.append_lock.lock()?;
        let mut segments = self.segments.write()?;
        for segment in segments.drain(..) {
            segment.mark_for_deletion();
        }
        Ok(())
    }

    /// Removes the segments after `index` and makes `index` current.
    pub(crate) fn discard_after(&self, index: usize) -> Result<()> {
        let mut segments = self.segments.write()?;
        if index + 1 < segments.len() {
            for segment in segments.drain(index + 1..) {
                tracing::warn!(path = %segment.path().display(), "Discarding uncommitted segment");
                segment.mark_for_deletion();
            }
        }
        Ok(())
    }

    /// Forward scan over every frame in the store.
    pub fn frames(&self) -> StoreFrames {
        StoreFrames {
            layer: self.layer,
            segments: self.segments(),
            segment: 0,
            pos: 0,
        }
    }
}

fn locate(segments: &[Arc<SegmentFile>], layer: Layer, addr: Address) -> Result<ChunkBytes> {
    if addr.layer() != Some(layer) {
        return Err(Error::InvalidChunk(format!(
            "{:?} is outside the {:?} layer",
            addr, layer
        )));
    }
    let offset = addr.offset();
    let index = segments.partition_point(|s| s.start() <= offset);
    let segment = index
        .checked_sub(1)
        .and_then(|i| segments.get(i))
        .filter(|s| offset < s.end())
        .ok_or_else(|| Error::InvalidChunk(format!("no segment holds {:?}", addr)))?;
    let range = segment.frame(offset - segment.start())?;
    Ok(ChunkBytes::in_segment(segment.clone(), range))
}

impl ChunkReader for SegmentStore {
    fn chunk(&self, addr: Address) -> Result<ChunkBytes> {
        let segments = self.segments.read()?;
        locate(&segments, self.layer, addr)
    }
}

impl ChunkWriter for SegmentStore {
    fn append(&self, chunk: &[u8]) -> Result<Address> {
        let _guard = self.append_lock.lock()?;
        let frame_len = frame::frame_len(chunk.len());
        let segment = self.segment_for(frame_len as u64)?;
        check_refs(chunk, self.layer, Address::new(self.layer, segment.end()))?;

        let mut buf = Vec::with_capacity(frame_len);
        push_frame(&mut buf, chunk)?;
        let local = segment.append(&buf)?;
        Ok(Address::new(self.layer, segment.start() + local))
    }

    fn append_batch(&self, chunks: &[Vec<u8>]) -> Result<Vec<Address>> {
        self.bulk_append(chunks)
    }

    fn flush(&self) -> Result<()> {
        SegmentStore::flush(self)
    }
}

/// A reader's pinned view of a store.
#[derive(Debug, Clone)]
pub struct Snapshot {
    layer: Layer,
    segments: Vec<Arc<SegmentFile>>,
}

impl ChunkReader for Snapshot {
    fn chunk(&self, addr: Address) -> Result<ChunkBytes> {
        locate(&self.segments, self.layer, addr)
    }
}

pub struct StoreFrames {
    layer: Layer,
    segments: Vec<Arc<SegmentFile>>,
    segment: usize,
    pos: usize,
}

impl Iterator for StoreFrames {
    type Item = Result<(Address, ChunkBytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let segment = self.segments.get(self.segment)?.clone();
            let bytes = segment.bytes();
            if self.pos >= bytes.len() {
                self.segment += 1;
                self.pos = 0;
                continue;
            }
            return match frame::frame_at(bytes, self.pos) {
                Some(range) => {
                    let addr = Address::new(self.layer, segment.start() + self.pos as u64);
                    self.pos = range.end + 4;
                    Some(Ok((addr, ChunkBytes::in_segment(segment, range))))
                }
                None => {
                    let err = Error::InvalidChunk(format!(
                        "no valid frame at offset {:#x} of {}",
                        self.pos,
                        segment.path().display()
                    ));
                    self.segment = self.segments.len();
                    Some(Err(err))
                }
            };
        }
    }
}
