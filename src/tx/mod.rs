//! Read and write transactions.
//!
//! A [`ReadTx`] is a snapshot: the root published by the last commit, plus
//! handles on the segments that root can reach. It never blocks writers and
//! never observes a half-finished commit.
//!
//! A [`WriteTx`] writes every new chunk to a private scratch store whose
//! addresses live in the scratch layer. Reads resolve each address in the
//! layer it names, so the transaction sees the committed graph with its own
//! changes on top. On commit the scratch chunks reachable from the new root
//! are copied into the durable log, children first, and a commit chunk naming
//! the translated root is appended. Dropping the transaction without
//! committing discards the scratch store.

mod read;
mod write;

pub use read::ReadTx;
pub use write::{TxDataWriter, TxStore, WriteTx};

use std::ops::ControlFlow;

use crate::chunk::Address;
use crate::data::{self, DataReader};
use crate::error::{Error, Result};
use crate::navigator::{self, Entity, EntityType};
use crate::path::Path;
use crate::store::ChunkReader;
use crate::wbb;

/// Read operations shared by both transaction kinds.
pub trait View {
    type Store: ChunkReader;

    fn store(&self) -> &Self::Store;

    /// Root map this transaction sees.
    fn root(&self) -> Address;

    fn entity(&self, path: impl Into<Path>) -> Result<Entity> {
        navigator::resolve(self.store(), self.root(), &path.into())
    }

    fn get_type(&self, path: impl Into<Path>) -> Result<EntityType> {
        Ok(self.entity(path)?.entity_type())
    }

    /// Entries of a map, elements of an array or bytes of a blob.
    fn get_size(&self, path: impl Into<Path>) -> Result<u64> {
        self.entity(path)?.size(self.store())
    }

    fn exists(&self, path: impl Into<Path>) -> Result<bool> {
        match self.entity(path) {
            Ok(_) => Ok(true),
            Err(Error::NotFound) | Err(Error::IndexOutOfBounds) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn get_data(&self, path: impl Into<Path>) -> Result<Vec<u8>> {
        match self.entity(path)? {
            Entity::Data(addr) => data::read_all(self.store(), addr),
            _ => Err(Error::NotData),
        }
    }

    fn data_reader(&self, path: impl Into<Path>) -> Result<DataReader<&Self::Store>> {
        match self.entity(path)? {
            Entity::Data(addr) => DataReader::new(self.store(), addr),
            _ => Err(Error::NotData),
        }
    }

    /// Visits the entries of the map at `path` in key order.
    fn for_each_map_entry<F>(&self, path: impl Into<Path>, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], Entity) -> ControlFlow<()>,
    {
        let map = match self.entity(path)? {
            Entity::Map(addr) => addr,
            _ => return Err(Error::NotMap),
        };
        let store = self.store();
        for entry in wbb::iter(store, map)? {
            let (key, value) = entry?;
            if visit(&key, Entity::load(store, value)?).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Visits the elements of the array at `path`, newest first.
    fn for_each_array_element<F>(&self, path: impl Into<Path>, mut visit: F) -> Result<()>
    where
        F: FnMut(u64, Entity) -> ControlFlow<()>,
    {
        let arr = match self.entity(path)? {
            Entity::Array(addr) => addr,
            _ => return Err(Error::NotArray),
        };
        let store = self.store();
        for (index, element) in crate::array::iter(store, arr)?.enumerate() {
            if visit(index as u64, Entity::load(store, element?)?).is_break() {
                break;
            }
        }
        Ok(())
    }
}
