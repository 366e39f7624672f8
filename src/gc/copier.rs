use std::collections::HashMap;

use itertools::Itertools;
use sha2::{Digest, Sha256};

use crate::chunk::{self, Address};
use crate::error::Result;
use crate::store::{ChunkReader, ChunkWriter};

type ContentKey = [u8; 32];

fn content_key(bytes: &[u8]) -> ContentKey {
    Sha256::digest(bytes).into()
}

/// Counters of one copy pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
    /// Root of the copied graph in the destination.
    pub root: Address,
    /// Chunks written to the destination.
    pub copied: u64,
    /// Refless chunks that reused an identical earlier copy.
    pub deduplicated: u64,
}

impl Default for CopyStats {
    fn default() -> Self {
        Self {
            root: Address::NIL,
            copied: 0,
            deduplicated: 0,
        }
    }
}

/// Copies the part of a chunk graph chosen by `select` into `dst`, children
/// before parents, rewriting references to the new addresses.
///
/// Chunks that `select` rejects are referenced as they are. Each selected
/// chunk is copied once however many parents it has.
pub struct Copier<'a, R: ?Sized, W: ?Sized, P> {
    src: &'a R,
    dst: &'a W,
    select: P,
    memo: HashMap<Address, Address>,
    dedup: Option<HashMap<ContentKey, Address>>,
    stats: CopyStats,
}

impl<'a, R, W, P> Copier<'a, R, W, P>
where
    R: ChunkReader + ?Sized,
    W: ChunkWriter + ?Sized,
    P: Fn(Address) -> bool,
{
    pub fn new(src: &'a R, dst: &'a W, select: P) -> Self {
        Self {
            src,
            dst,
            select,
            memo: HashMap::new(),
            dedup: None,
            stats: CopyStats::default(),
        }
    }

    /// Collapses byte-identical refless chunks into one copy.
    pub fn with_dedup(mut self, enabled: bool) -> Self {
        self.dedup = enabled.then(HashMap::new);
        self
    }

    pub fn stats(&self) -> CopyStats {
        self.stats
    }

    fn selected(&self, addr: Address) -> bool {
        !addr.is_nil() && (self.select)(addr)
    }

    /// Copies the graph under `root` and returns the stats, `root` included.
    pub fn run(mut self, root: Address) -> Result<CopyStats> {
        self.stats.root = self.copy(root)?;
        Ok(self.stats)
    }

    /// Address of `addr` in the destination, copying it first if needed.
    pub fn copy(&mut self, addr: Address) -> Result<Address> {
        if !self.selected(addr) {
            return Ok(addr);
        }
        if let Some(done) = self.memo.get(&addr) {
            return Ok(*done);
        }

        let bytes = self.src.chunk(addr)?;
        let decoded = bytes.decode()?;
        let refs = decoded.refs.to_vec();
        self.copy_refless_children(&refs)?;

        let mut translated = Vec::with_capacity(refs.len());
        for r in &refs {
            translated.push(self.copy(*r)?);
        }

        let new = if translated == refs {
            self.write(&bytes, refs.is_empty())?
        } else {
            let packed = chunk::pack(decoded.kind, &translated, decoded.data)?;
            self.write(&packed, false)?
        };
        self.memo.insert(addr, new);
        Ok(new)
    }

    fn write(&mut self, packed: &[u8], refless: bool) -> Result<Address> {
        let key = match (&self.dedup, refless) {
            (Some(_), true) => Some(content_key(packed)),
            _ => None,
        };
        if let (Some(seen), Some(key)) = (&self.dedup, &key) {
            if let Some(existing) = seen.get(key) {
                self.stats.deduplicated += 1;
                return Ok(*existing);
            }
        }
        let new = self.dst.append(packed)?;
        self.stats.copied += 1;
        if let (Some(seen), Some(key)) = (&mut self.dedup, key) {
            seen.insert(key, new);
        }
        Ok(new)
    }

    /// Writes the not yet copied refless children of a node in one batch.
    fn copy_refless_children(&mut self, refs: &[Address]) -> Result<()> {
        let mut batch: Vec<Vec<u8>> = Vec::new();
        let mut keys: Vec<Option<ContentKey>> = Vec::new();
        let mut slots: Vec<(Address, usize)> = Vec::new();
        let mut batch_index: HashMap<ContentKey, usize> = HashMap::new();

        for r in refs.iter().copied().unique() {
            if !self.selected(r) || self.memo.contains_key(&r) {
                continue;
            }
            let bytes = self.src.chunk(r)?;
            if !bytes.decode()?.refs.is_empty() {
                continue;
            }
            let key = self.dedup.as_ref().map(|_| content_key(&bytes));
            if let (Some(seen), Some(key)) = (&self.dedup, &key) {
                if let Some(existing) = seen.get(key) {
                    self.memo.insert(r, *existing);
                    self.stats.deduplicated += 1;
                    continue;
                }
                if let Some(index) = batch_index.get(key) {
                    slots.push((r, *index));
                    self.stats.deduplicated += 1;
                    continue;
                }
                batch_index.insert(*key, batch.len());
            }
            slots.push((r, batch.len()));
            keys.push(key);
            batch.push(bytes.to_vec());
        }

        if batch.is_empty() {
            return Ok(());
        }

        let written = self.dst.append_batch(&batch)?;
        self.stats.copied += written.len() as u64;
        for (r, index) in slots {
            self.memo.insert(r, written[index]);
        }
        if let Some(seen) = &mut self.dedup {
            for (key, addr) in keys.into_iter().zip(&written) {
                if let Some(key) = key {
                    seen.insert(key, *addr);
                }
            }
        }
        Ok(())
    }
}
