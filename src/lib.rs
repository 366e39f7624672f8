//! An embedded, append-only, copy-on-write database of nested maps, arrays
//! and byte blobs.
//!
//! ```no_run
//! use cowdb::{Database, View};
//!
//! let db = Database::open("/tmp/cowdb")?;
//! let mut tx = db.tx()?;
//! tx.create_map("/users")?;
//! tx.put_data("/users/ada", b"analyst")?;
//! tx.commit()?;
//!
//! let read = db.read_tx()?;
//! assert_eq!(read.get_data("/users/ada")?, b"analyst");
//! # Ok::<(), cowdb::Error>(())
//! ```
//!
//! Segment files are mapped past their end and unlinked while still mapped,
//! so only unix platforms are supported.

#[cfg(not(unix))]
compile_error!("cowdb only supports unix platforms");

pub mod array;
pub mod chunk;
pub mod config;
pub mod data;
pub mod db;
pub mod error;
pub mod flock;
pub mod gc;
pub mod log;
pub mod navigator;
pub mod path;
pub mod store;
pub mod tx;
pub mod wbb;

pub use chunk::{Address, ChunkType};
pub use config::DbConfig;
pub use db::{CompactStats, Database};
pub use error::{Error, Result};
pub use navigator::{Entity, EntityType};
pub use path::{Path, Step};
pub use tx::{ReadTx, View, WriteTx};
