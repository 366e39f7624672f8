//! Walking and rewriting paths through nested maps and arrays.
//!
//! Every rewrite is copy-on-write: the entity at the end of the path is
//! replaced, then each ancestor is rewritten to point at its new child, and
//! the new root is returned. Ancestors whose child did not change are left
//! alone.

use crate::array;
use crate::chunk::{Address, ChunkType};
use crate::data;
use crate::error::{Error, Result};
use crate::path::{Path, Step};
use crate::store::{ChunkReader, ChunkWriter};
use crate::wbb;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    Map,
    Array,
    Data,
}

/// An entity root, tagged by the type of its root chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Map(Address),
    Array(Address),
    Data(Address),
}

impl Entity {
    pub fn load<S: ChunkReader + ?Sized>(store: &S, addr: Address) -> Result<Self> {
        let bytes = store.chunk(addr)?;
        let kind = bytes.decode()?.kind;
        match kind {
            ChunkType::WbbNode => Ok(Entity::Map(addr)),
            ChunkType::ArrayLeaf | ChunkType::ArrayNode => Ok(Entity::Array(addr)),
            ChunkType::DataLeaf | ChunkType::DataHeader => Ok(Entity::Data(addr)),
            other => Err(Error::InvalidChunk(format!(
                "{:?} chunk at {:?} is not an entity root",
                other, addr
            ))),
        }
    }

    pub fn addr(&self) -> Address {
        match self {
            Entity::Map(addr) | Entity::Array(addr) | Entity::Data(addr) => *addr,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Entity::Map(_) => EntityType::Map,
            Entity::Array(_) => EntityType::Array,
            Entity::Data(_) => EntityType::Data,
        }
    }

    /// Entries of a map, elements of an array or bytes of a blob.
    pub fn size<S: ChunkReader + ?Sized>(&self, store: &S) -> Result<u64> {
        match self {
            Entity::Map(addr) => wbb::count(store, *addr),
            Entity::Array(addr) => array::size(store, *addr),
            Entity::Data(addr) => data::size(store, *addr),
        }
    }

    /// Address of the child reached by `step`.
    pub fn child<S: ChunkReader + ?Sized>(&self, store: &S, step: &Step) -> Result<Address> {
        match (self, step) {
            (Entity::Map(addr), Step::Key(key)) => wbb::search(store, *addr, key),
            (Entity::Array(addr), Step::Index(index)) => array::get(store, *addr, *index),
            (Entity::Map(_), Step::Index(_)) => Err(Error::NotArray),
            (Entity::Array(_), Step::Key(_)) => Err(Error::NotMap),
            (Entity::Data(_), _) => Err(Error::WrongPath),
        }
    }

    /// Copy of this entity with the child at `step` replaced.
    fn replace_child<S: ChunkWriter + ?Sized>(
        &self,
        store: &S,
        step: &Step,
        child: Address,
    ) -> Result<Address> {
        match (self, step) {
            (Entity::Map(addr), Step::Key(key)) => wbb::insert(store, *addr, key, child),
            (Entity::Array(addr), Step::Index(index)) => array::set(store, *addr, *index, child),
            (Entity::Map(_), Step::Index(_)) => Err(Error::NotArray),
            (Entity::Array(_), Step::Key(_)) => Err(Error::NotMap),
            (Entity::Data(_), _) => Err(Error::WrongPath),
        }
    }
}

/// Follows `path` from `root`.
pub fn resolve<S: ChunkReader + ?Sized>(store: &S, root: Address, path: &Path) -> Result<Entity> {
    let mut entity = Entity::load(store, root)?;
    for step in path.steps() {
        let child = entity.child(store, step)?;
        entity = Entity::load(store, child)?;
    }
    Ok(entity)
}

/// Replaces the entity at `path` with `f(old)` and rewrites its ancestors.
pub fn rewrite<S, F>(store: &S, root: Address, path: &Path, f: F) -> Result<Address>
where
    S: ChunkWriter + ?Sized,
    F: FnOnce(Address) -> Result<Address>,
{
    rewrite_steps(store, root, path.steps(), f)
}

fn rewrite_steps<S, F>(store: &S, addr: Address, steps: &[Step], f: F) -> Result<Address>
where
    S: ChunkWriter + ?Sized,
    F: FnOnce(Address) -> Result<Address>,
{
    let (step, rest) = match steps.split_first() {
        Some(split) => split,
        None => return f(addr),
    };
    let entity = Entity::load(store, addr)?;
    let child = entity.child(store, step)?;
    let updated = rewrite_steps(store, child, rest, f)?;
    if updated == child {
        return Ok(addr);
    }
    entity.replace_child(store, step, updated)
}

/// Rewrites the parent of the last step with `f(parent, last_step)`.
///
/// `Error::WrongPath` for the root path, which has no parent.
pub fn modify_on_path<S, F>(store: &S, root: Address, path: &Path, f: F) -> Result<Address>
where
    S: ChunkWriter + ?Sized,
    F: FnOnce(Entity, &Step) -> Result<Address>,
{
    let (parent, last) = path.split_last().ok_or(Error::WrongPath)?;
    rewrite_steps(store, root, parent, |parent_addr| {
        let parent = Entity::load(store, parent_addr)?;
        f(parent, last)
    })
}

/// Adds a new map entry at `path` whose value `make` writes.
///
/// `Error::AlreadyExists` if the key is taken; the parent must be a map.
pub fn create<S, F>(store: &S, root: Address, path: &Path, make: F) -> Result<Address>
where
    S: ChunkWriter + ?Sized,
    F: FnOnce(&S) -> Result<Address>,
{
    modify_on_path(store, root, path, |parent, last| match (parent, last) {
        (Entity::Map(map), Step::Key(key)) => {
            if wbb::contains(store, map, key)? {
                return Err(Error::AlreadyExists);
            }
            let value = make(store)?;
            wbb::insert(store, map, key, value)
        }
        (Entity::Map(_), Step::Index(_)) => Err(Error::NotArray),
        (Entity::Array(_), _) => Err(Error::NotMap),
        (Entity::Data(_), _) => Err(Error::WrongPath),
    })
}

/// Stores a blob at `path`, creating the entry or replacing existing data.
///
/// Under a map the key may be new; under an array the index must exist.
/// Replacing anything but data is `Error::NotData`.
pub fn put_data<S, F>(store: &S, root: Address, path: &Path, make: F) -> Result<Address>
where
    S: ChunkWriter + ?Sized,
    F: FnOnce(&S) -> Result<Address>,
{
    let existing_is_data = |addr: Address| -> Result<()> {
        match Entity::load(store, addr)? {
            Entity::Data(_) => Ok(()),
            _ => Err(Error::NotData),
        }
    };
    modify_on_path(store, root, path, |parent, last| match (parent, last) {
        (Entity::Map(map), Step::Key(key)) => {
            match wbb::search(store, map, key) {
                Ok(old) => existing_is_data(old)?,
                Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
            let value = make(store)?;
            wbb::insert(store, map, key, value)
        }
        (Entity::Array(arr), Step::Index(index)) => {
            existing_is_data(array::get(store, arr, *index)?)?;
            let value = make(store)?;
            array::set(store, arr, *index, value)
        }
        (Entity::Map(_), Step::Index(_)) => Err(Error::NotArray),
        (Entity::Array(_), Step::Key(_)) => Err(Error::NotMap),
        (Entity::Data(_), _) => Err(Error::WrongPath),
    })
}

/// Removes the map entry at `path`.
pub fn remove<S: ChunkWriter + ?Sized>(store: &S, root: Address, path: &Path) -> Result<Address> {
    modify_on_path(store, root, path, |parent, last| match (parent, last) {
        (Entity::Map(map), Step::Key(key)) => wbb::delete(store, map, key),
        (Entity::Map(_), Step::Index(_)) => Err(Error::NotArray),
        (Entity::Array(_), _) => Err(Error::NotMap),
        (Entity::Data(_), _) => Err(Error::WrongPath),
    })
}

/// Prepends a value written by `make` to the array at `path`.
pub fn prepend<S, F>(store: &S, root: Address, path: &Path, make: F) -> Result<Address>
where
    S: ChunkWriter + ?Sized,
    F: FnOnce(&S) -> Result<Address>,
{
    rewrite(store, root, path, |arr| {
        if !matches!(Entity::load(store, arr)?, Entity::Array(_)) {
            return Err(Error::NotArray);
        }
        let value = make(store)?;
        array::prepend(store, arr, value)
    })
}

/// Drops the oldest element of the array at `path`.
pub fn delete_last<S: ChunkWriter + ?Sized>(store: &S, root: Address, path: &Path) -> Result<Address> {
    rewrite(store, root, path, |arr| array::delete_last(store, arr))
}
