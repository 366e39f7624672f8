//! A single append-only segment file.
//!
//! Reads go through a read-only memory map covering `max_size` bytes, so the
//! map never has to move while the file grows. Writes use positional file
//! writes and only then publish the new length, which keeps readers from ever
//! observing a half-written frame.

use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use memmap2::{Mmap, MmapOptions};

use super::frame::{self, Frames, FramesRev};
use crate::error::{Error, Result};

pub struct SegmentFile {
    path: PathBuf,
    file: File,
    map: Mmap,
    /// Offset of the first byte of this file in the store's virtual space.
    start: u64,
    max_size: u64,
    growth_step: u64,
    /// Bytes published to readers; the next free byte.
    len: AtomicU64,
    /// Allocated file length, guarded so that appends are serialised.
    limit: Mutex<u64>,
    delete_on_drop: AtomicBool,
}

impl std::fmt::Debug for SegmentFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentFile")
            .field("path", &self.path)
            .field("start", &self.start)
            .field("len", &self.len())
            .finish()
    }
}

impl SegmentFile {
    /// Opens `path`, creating it when `create` is set. The file length is the
    /// first free byte.
    pub fn open(
        path: impl Into<PathBuf>,
        start: u64,
        max_size: u64,
        growth_step: u64,
        create: bool,
    ) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len > max_size {
            return Err(Error::Corruption(format!(
                "segment {} holds {} bytes, more than the {} byte cap",
                path.display(),
                len,
                max_size
            )));
        }

        let map = unsafe { MmapOptions::new().len(max_size as usize).map(&file)? };

        Ok(Self {
            path,
            file,
            map,
            start,
            max_size,
            growth_step,
            len: AtomicU64::new(len),
            limit: Mutex::new(len),
            delete_on_drop: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset just past the last published byte, in virtual space.
    pub fn end(&self) -> u64 {
        self.start + self.len()
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Bytes still available before the size cap.
    pub fn remaining(&self) -> u64 {
        self.max_size - self.len()
    }

    /// Appends raw bytes and returns the local offset they start at.
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        let mut limit = self.limit.lock()?;
        let offset = self.len.load(Ordering::Acquire);
        let needed = offset + bytes.len() as u64;
        if needed > self.max_size {
            return Err(Error::ChunkTooLarge(bytes.len()));
        }

        if needed > *limit {
            let steps = (needed - *limit).div_ceil(self.growth_step);
            let new_limit = (*limit + steps * self.growth_step).min(self.max_size);
            self.file.set_len(new_limit)?;
            *limit = new_limit;
        }

        self.file.write_all_at(bytes, offset)?;
        self.len.store(needed, Ordering::Release);
        Ok(offset)
    }

    pub fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Published bytes of the file.
    pub fn bytes(&self) -> &[u8] {
        &self.map[..self.len() as usize]
    }

    /// Chunk range of the frame at `local`, validated against published bytes.
    pub fn frame(&self, local: u64) -> Result<Range<usize>> {
        let bytes = self.bytes();
        frame::frame_at(bytes, local as usize).ok_or_else(|| {
            Error::InvalidChunk(format!(
                "no valid frame at offset {:#x} of {}",
                local,
                self.path.display()
            ))
        })
    }

    pub fn slice(&self, range: Range<usize>) -> &[u8] {
        &self.map[range]
    }

    pub fn frames(&self) -> Frames<'_> {
        Frames::new(self.bytes())
    }

    pub fn frames_rev(&self) -> FramesRev<'_> {
        FramesRev::new(self.bytes())
    }

    /// Cuts the file to `len` bytes. Used by recovery before anything reads
    /// past `len`.
    pub fn truncate(&self, len: u64) -> Result<()> {
        let mut limit = self.limit.lock()?;
        if len > self.len() {
            return Err(Error::InvalidInput(format!(
                "cannot truncate {} to {} bytes, it only holds {}",
                self.path.display(),
                len,
                self.len()
            )));
        }
        self.file.set_len(len)?;
        self.file.sync_all()?;
        *limit = len;
        self.len.store(len, Ordering::Release);
        Ok(())
    }

    /// Drops the growth padding past the published length.
    pub fn close(&self) -> Result<()> {
        let mut limit = self.limit.lock()?;
        let len = self.len();
        if *limit != len {
            self.file.set_len(len)?;
            *limit = len;
        }
        self.file.sync_all()?;
        Ok(())
    }

    /// Unlinks the file once the last handle to it is dropped.
    pub fn mark_for_deletion(&self) {
        self.delete_on_drop.store(true, Ordering::SeqCst);
    }
}

impl Drop for SegmentFile {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::SeqCst) {
            match std::fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!(path = %self.path.display(), "Deleted segment file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to delete segment file"
                ),
            }
        }
    }
}
