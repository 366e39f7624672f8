//! The durable, segmented append-only log.
//!
//! # Directory Layout
//!
//! ```text
//! db/
//! ├── cowdb.lock
//! ├── 0000000000000000.seg      full segment
//! ├── 0000000000a00000.seg      full segment
//! ├── 0000000001400000.seg      current segment
//! └── 0000000000000000.scratch  only while a write transaction runs
//! ```
//!
//! Every file holds back-to-back frames (see [`frame`]). A file's name is the
//! offset of its first byte in the store's virtual space, so the durable
//! address of a chunk is `1 << 62 | (file start + offset in file)`.

pub mod frame;
pub mod recovery;
pub mod segment;
pub mod store;

pub use recovery::{recover, Recovered};
pub use segment::SegmentFile;
pub use store::{SegmentStore, Snapshot, StoreOptions, SCRATCH_EXTENSION, SEGMENT_EXTENSION};
