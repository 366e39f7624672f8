//! Persistent fan-out-4 array that grows at the head.
//!
//! # Chunk Layout
//!
//! ```text
//! ArrayLeaf  refs: up to 4 elements, newest first    payload: empty
//! ArrayNode  refs: exactly 4 children                payload: level:u16 | size:u64 * 4
//! ```
//!
//! Children of a node at level `l` hold at most `4^l` elements each; a leaf
//! counts as level 0. Buckets are head-first: leading buckets are empty
//! leaves and the first non-empty bucket holds index 0, so prepending walks
//! towards the front and deleting the last element walks towards the back.
//!
//! A child always sits at a lower level than its parent. Only the root grows
//! a level, and only once its head bucket can take no more elements.

mod iter;

pub use iter::Iter;

use std::ops::ControlFlow;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::chunk::{Address, ChunkType};
use crate::error::{Error, Result};
use crate::store::{ChunkReader, ChunkWriter};

pub const FANOUT: usize = 4;

const NODE_PAYLOAD_LEN: usize = 2 + 8 * FANOUT;

/// Elements a child of a node at `level` may hold.
fn capacity(level: u16) -> u64 {
    (FANOUT as u64).saturating_pow(level as u32)
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub level: u16,
    pub children: [Address; FANOUT],
    pub sizes: [u64; FANOUT],
}

impl Node {
    fn size(&self) -> u64 {
        self.sizes.iter().sum()
    }

    fn first_non_empty(&self) -> Option<usize> {
        self.sizes.iter().position(|s| *s > 0)
    }

    fn last_non_empty(&self) -> Option<usize> {
        self.sizes.iter().rposition(|s| *s > 0)
    }

    /// Bucket holding `index`, and the index within that bucket.
    fn locate(&self, mut index: u64) -> Option<(usize, u64)> {
        for (bucket, size) in self.sizes.iter().enumerate() {
            if index < *size {
                return Some((bucket, index));
            }
            index -= size;
        }
        None
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Loaded {
    Leaf(Vec<Address>),
    Node(Node),
}

pub(crate) fn load<S: ChunkReader + ?Sized>(store: &S, addr: Address) -> Result<Loaded> {
    let bytes = store.chunk(addr)?;
    let chunk = bytes.decode()?;
    match chunk.kind {
        ChunkType::ArrayLeaf => {
            if chunk.refs.len() > FANOUT || !chunk.data.is_empty() {
                return Err(Error::InvalidChunk(format!(
                    "array leaf at {:?} has {} refs",
                    addr,
                    chunk.refs.len()
                )));
            }
            Ok(Loaded::Leaf(chunk.refs.to_vec()))
        }
        ChunkType::ArrayNode => {
            if chunk.refs.len() != FANOUT || chunk.data.len() != NODE_PAYLOAD_LEN {
                return Err(Error::InvalidChunk(format!(
                    "array node at {:?} has {} refs and {} payload bytes",
                    addr,
                    chunk.refs.len(),
                    chunk.data.len()
                )));
            }
            let level = BigEndian::read_u16(&chunk.data[..2]);
            if level == 0 {
                return Err(Error::InvalidChunk(format!("array node at {:?} has level 0", addr)));
            }
            let mut children = [Address::NIL; FANOUT];
            let mut sizes = [0u64; FANOUT];
            for (i, child) in chunk.refs.iter().enumerate() {
                children[i] = child;
                sizes[i] = BigEndian::read_u64(&chunk.data[2 + 8 * i..10 + 8 * i]);
            }
            Ok(Loaded::Node(Node {
                level,
                children,
                sizes,
            }))
        }
        _ => Err(Error::NotArray),
    }
}

fn write_leaf<S: ChunkWriter + ?Sized>(store: &S, elements: &[Address]) -> Result<Address> {
    store.write_chunk(ChunkType::ArrayLeaf, elements, &[])
}

fn write_node<S: ChunkWriter + ?Sized>(store: &S, node: &Node) -> Result<Address> {
    let mut payload = Vec::with_capacity(NODE_PAYLOAD_LEN);
    payload.write_u16::<BigEndian>(node.level)?;
    for size in node.sizes {
        payload.write_u64::<BigEndian>(size)?;
    }
    store.write_chunk(ChunkType::ArrayNode, &node.children, &payload)
}

/// `[empty, empty, [value], old]` one level above `old`.
fn promote<S: ChunkWriter + ?Sized>(
    store: &S,
    level: u16,
    old: Address,
    old_size: u64,
    value: Address,
) -> Result<Address> {
    let empty = create_empty(store)?;
    let single = write_leaf(store, &[value])?;
    write_node(
        store,
        &Node {
            level,
            children: [empty, empty, single, old],
            sizes: [0, 0, 1, old_size],
        },
    )
}

pub fn create_empty<S: ChunkWriter + ?Sized>(store: &S) -> Result<Address> {
    write_leaf(store, &[])
}

pub fn size<S: ChunkReader + ?Sized>(store: &S, root: Address) -> Result<u64> {
    Ok(match load(store, root)? {
        Loaded::Leaf(elements) => elements.len() as u64,
        Loaded::Node(node) => node.size(),
    })
}

/// Makes `value` element 0, shifting every other element up by one.
pub fn prepend<S: ChunkWriter + ?Sized>(store: &S, root: Address, value: Address) -> Result<Address> {
    prepend_within(store, root, value, u16::MAX)?
        .ok_or_else(|| Error::InvalidChunk(format!("array at {:?} cannot grow another level", root)))
}

/// Prepends without letting the subtree rise above `max_level`.
///
/// `None` when the head of the subtree is saturated; nothing is written then.
fn prepend_within<S: ChunkWriter + ?Sized>(
    store: &S,
    root: Address,
    value: Address,
    max_level: u16,
) -> Result<Option<Address>> {
    let mut node = match load(store, root)? {
        Loaded::Leaf(elements) if elements.len() < FANOUT => {
            let mut grown = Vec::with_capacity(elements.len() + 1);
            grown.push(value);
            grown.extend(elements);
            return write_leaf(store, &grown).map(Some);
        }
        Loaded::Leaf(elements) if max_level >= 1 => {
            return promote(store, 1, root, elements.len() as u64, value).map(Some);
        }
        Loaded::Leaf(_) => return Ok(None),
        Loaded::Node(node) => node,
    };

    let head = node.first_non_empty().unwrap_or(FANOUT - 1);
    // The head bucket, then the empty one in front of it.
    for bucket in std::iter::once(head).chain(head.checked_sub(1)) {
        if node.sizes[bucket] >= capacity(node.level) {
            continue;
        }
        if let Some(child) = prepend_within(store, node.children[bucket], value, node.level - 1)? {
            node.children[bucket] = child;
            node.sizes[bucket] += 1;
            return write_node(store, &node).map(Some);
        }
    }

    if node.level < max_level {
        return promote(store, node.level + 1, root, node.size(), value).map(Some);
    }
    Ok(None)
}

/// Removes the oldest element; `Error::ArrayEmpty` if there is none.
pub fn delete_last<S: ChunkWriter + ?Sized>(store: &S, root: Address) -> Result<Address> {
    match load(store, root)? {
        Loaded::Leaf(elements) if elements.is_empty() => Err(Error::ArrayEmpty),
        Loaded::Leaf(elements) => write_leaf(store, &elements[..elements.len() - 1]),
        Loaded::Node(mut node) => {
            let bucket = node.last_non_empty().ok_or(Error::ArrayEmpty)?;
            let child = delete_last(store, node.children[bucket])?;
            if node.sizes[bucket] > 1 {
                node.children[bucket] = child;
                node.sizes[bucket] -= 1;
                return write_node(store, &node);
            }
            if node.size() == 1 {
                return Ok(child);
            }
            // The emptied bucket leaves and a fresh empty one opens at the head.
            node.children.copy_within(0..bucket, 1);
            node.sizes.copy_within(0..bucket, 1);
            node.children[0] = child;
            node.sizes[0] = 0;
            write_node(store, &node)
        }
    }
}

/// Element at `index`, 0 being the newest.
pub fn get<S: ChunkReader + ?Sized>(store: &S, root: Address, mut index: u64) -> Result<Address> {
    let mut addr = root;
    loop {
        match load(store, addr)? {
            Loaded::Leaf(elements) => {
                return elements
                    .get(index as usize)
                    .copied()
                    .ok_or(Error::IndexOutOfBounds)
            }
            Loaded::Node(node) => {
                let (bucket, within) = node.locate(index).ok_or(Error::IndexOutOfBounds)?;
                addr = node.children[bucket];
                index = within;
            }
        }
    }
}

/// Replaces the element at `index`.
pub fn set<S: ChunkWriter + ?Sized>(
    store: &S,
    root: Address,
    index: u64,
    value: Address,
) -> Result<Address> {
    match load(store, root)? {
        Loaded::Leaf(mut elements) => {
            let slot = elements
                .get_mut(index as usize)
                .ok_or(Error::IndexOutOfBounds)?;
            if *slot == value {
                return Ok(root);
            }
            *slot = value;
            write_leaf(store, &elements)
        }
        Loaded::Node(mut node) => {
            let (bucket, within) = node.locate(index).ok_or(Error::IndexOutOfBounds)?;
            let child = set(store, node.children[bucket], within, value)?;
            if child == node.children[bucket] {
                return Ok(root);
            }
            node.children[bucket] = child;
            write_node(store, &node)
        }
    }
}

/// Iterator over the elements, newest first.
pub fn iter<S: ChunkReader + ?Sized>(store: &S, root: Address) -> Result<Iter<'_, S>> {
    Iter::new(store, root)
}

/// Visits `(index, element)` from index 0 until `visit` breaks.
pub fn for_each<S, F>(store: &S, root: Address, mut visit: F) -> Result<()>
where
    S: ChunkReader + ?Sized,
    F: FnMut(u64, Address) -> ControlFlow<()>,
{
    for (index, element) in iter(store, root)?.enumerate() {
        if visit(index as u64, element?).is_break() {
            break;
        }
    }
    Ok(())
}
