//! Persistent weight-balanced binary search tree for ordered maps.
//!
//! # Node Layout
//!
//! ```text
//! refs:    [value, left, right]              left/right are NIL when absent
//! payload: left_count:u64 | right_count:u64 | key bytes
//! ```
//!
//! The empty map is a `WbbNode` chunk with neither refs nor payload. Keys
//! compare as raw bytes. Every node satisfies the weight-balance rule with
//! `W = 4`: when `left + right > 2`, the larger side holds at most `W` times
//! the entries of the smaller one.
//!
//! All operations are copy-on-write: they return a new root and leave every
//! existing chunk untouched.

mod iter;
mod node;

pub use iter::Iter;

use std::cmp::Ordering;
use std::ops::ControlFlow;

use crate::chunk::Address;
use crate::error::{Error, Result};
use crate::store::{ChunkReader, ChunkWriter};
use node::{load_some, root_tree, write, Tree};

pub const WEIGHT: u64 = 4;

pub fn create_empty<S: ChunkWriter + ?Sized>(store: &S) -> Result<Address> {
    node::write_empty(store)
}

/// True when a node with these subtree counts needs no rotation.
pub fn counts_balanced(left: u64, right: u64) -> bool {
    left + right <= 2 || left.max(right) <= WEIGHT * left.min(right)
}

/// Inserts `key`, replacing the value if the key is already present.
pub fn insert<S: ChunkWriter + ?Sized>(
    store: &S,
    root: Address,
    key: &[u8],
    value: Address,
) -> Result<Address> {
    let tree = root_tree(store, root)?;
    let updated = insert_into(store, tree, key, value)?;
    Ok(if updated == tree { root } else { updated.addr })
}

fn insert_into<S: ChunkWriter + ?Sized>(
    store: &S,
    tree: Tree,
    key: &[u8],
    value: Address,
) -> Result<Tree> {
    if tree.is_empty() {
        return write(store, key, value, Tree::EMPTY, Tree::EMPTY);
    }
    let node = load_some(store, tree)?;
    match key.cmp(&node.key) {
        Ordering::Less => {
            let left = insert_into(store, node.left, key, value)?;
            if left == node.left {
                return Ok(tree);
            }
            balance(store, &node.key, node.value, left, node.right)
        }
        Ordering::Greater => {
            let right = insert_into(store, node.right, key, value)?;
            if right == node.right {
                return Ok(tree);
            }
            balance(store, &node.key, node.value, node.left, right)
        }
        Ordering::Equal if node.value == value => Ok(tree),
        Ordering::Equal => write(store, key, value, node.left, node.right),
    }
}

/// Removes `key`; `Error::NotFound` if it is absent.
pub fn delete<S: ChunkWriter + ?Sized>(store: &S, root: Address, key: &[u8]) -> Result<Address> {
    let tree = root_tree(store, root)?;
    let updated = delete_from(store, tree, key)?;
    if updated.is_empty() {
        return create_empty(store);
    }
    Ok(updated.addr)
}

fn delete_from<S: ChunkWriter + ?Sized>(store: &S, tree: Tree, key: &[u8]) -> Result<Tree> {
    if tree.is_empty() {
        return Err(Error::NotFound);
    }
    let node = load_some(store, tree)?;
    match key.cmp(&node.key) {
        Ordering::Less => {
            let left = delete_from(store, node.left, key)?;
            balance(store, &node.key, node.value, left, node.right)
        }
        Ordering::Greater => {
            let right = delete_from(store, node.right, key)?;
            balance(store, &node.key, node.value, node.left, right)
        }
        Ordering::Equal if node.left.is_empty() => Ok(node.right),
        Ordering::Equal if node.right.is_empty() => Ok(node.left),
        Ordering::Equal => {
            let (successor, value, right) = delete_min(store, node.right)?;
            balance(store, &successor, value, node.left, right)
        }
    }
}

/// Removes the smallest entry of a non-empty subtree.
fn delete_min<S: ChunkWriter + ?Sized>(store: &S, tree: Tree) -> Result<(Vec<u8>, Address, Tree)> {
    let node = load_some(store, tree)?;
    if node.left.is_empty() {
        return Ok((node.key, node.value, node.right));
    }
    let (key, value, left) = delete_min(store, node.left)?;
    let rebuilt = balance(store, &node.key, node.value, left, node.right)?;
    Ok((key, value, rebuilt))
}

/// Writes a node over `left` and `right`, rotating if they are out of balance.
fn balance<S: ChunkWriter + ?Sized>(
    store: &S,
    key: &[u8],
    value: Address,
    left: Tree,
    right: Tree,
) -> Result<Tree> {
    if counts_balanced(left.count, right.count) {
        return write(store, key, value, left, right);
    }

    let (new_left, top_key, top_value, new_right) = if right.count > WEIGHT * left.count {
        let r = load_some(store, right)?;
        if r.left.count < r.right.count {
            let new_left = balance(store, key, value, left, r.left)?;
            (new_left, r.key, r.value, r.right)
        } else {
            let rl = load_some(store, r.left)?;
            let new_left = balance(store, key, value, left, rl.left)?;
            let new_right = balance(store, &r.key, r.value, rl.right, r.right)?;
            (new_left, rl.key, rl.value, new_right)
        }
    } else {
        let l = load_some(store, left)?;
        if l.right.count < l.left.count {
            let new_right = balance(store, key, value, l.right, right)?;
            (l.left, l.key, l.value, new_right)
        } else {
            let lr = load_some(store, l.right)?;
            let new_left = balance(store, &l.key, l.value, l.left, lr.left)?;
            let new_right = balance(store, key, value, lr.right, right)?;
            (new_left, lr.key, lr.value, new_right)
        }
    };

    if counts_balanced(new_left.count, new_right.count) {
        return write(store, &top_key, top_value, new_left, new_right);
    }

    // A single rotation cannot always absorb a large skew; rebuild instead.
    tracing::trace!(
        left = new_left.count,
        right = new_right.count,
        "Rebuilding map subtree after rotation"
    );
    let mut entries = collect(store, new_left)?;
    entries.push((top_key, top_value));
    entries.extend(collect(store, new_right)?);
    build(store, &entries)
}

fn collect<S: ChunkReader + ?Sized>(store: &S, tree: Tree) -> Result<Vec<(Vec<u8>, Address)>> {
    if tree.is_empty() {
        return Ok(Vec::new());
    }
    Iter::from_tree(store, tree)?.collect()
}

/// Perfectly balanced subtree over sorted entries.
fn build<S: ChunkWriter + ?Sized>(store: &S, entries: &[(Vec<u8>, Address)]) -> Result<Tree> {
    if entries.is_empty() {
        return Ok(Tree::EMPTY);
    }
    let mid = entries.len() / 2;
    let left = build(store, &entries[..mid])?;
    let right = build(store, &entries[mid + 1..])?;
    let (key, value) = &entries[mid];
    write(store, key, *value, left, right)
}

/// Value stored under `key`.
pub fn search<S: ChunkReader + ?Sized>(store: &S, root: Address, key: &[u8]) -> Result<Address> {
    let mut tree = root_tree(store, root)?;
    while !tree.is_empty() {
        let node = load_some(store, tree)?;
        tree = match key.cmp(&node.key) {
            Ordering::Less => node.left,
            Ordering::Greater => node.right,
            Ordering::Equal => return Ok(node.value),
        };
    }
    Err(Error::NotFound)
}

pub fn contains<S: ChunkReader + ?Sized>(store: &S, root: Address, key: &[u8]) -> Result<bool> {
    match search(store, root, key) {
        Ok(_) => Ok(true),
        Err(Error::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn count<S: ChunkReader + ?Sized>(store: &S, root: Address) -> Result<u64> {
    Ok(root_tree(store, root)?.count)
}

/// In-order iterator over `(key, value)`.
pub fn iter<S: ChunkReader + ?Sized>(store: &S, root: Address) -> Result<Iter<'_, S>> {
    Iter::new(store, root, None)
}

/// In-order iterator over the entries with keys strictly greater than `key`.
pub fn iter_after<'a, S: ChunkReader + ?Sized>(
    store: &'a S,
    root: Address,
    key: &[u8],
) -> Result<Iter<'a, S>> {
    Iter::new(store, root, Some(key))
}

/// Visits entries in key order until `visit` breaks.
pub fn for_each<S, F>(store: &S, root: Address, visit: F) -> Result<()>
where
    S: ChunkReader + ?Sized,
    F: FnMut(&[u8], Address) -> ControlFlow<()>,
{
    drive(iter(store, root)?, visit)
}

/// Like [`for_each`], starting after `key`.
pub fn for_each_after<S, F>(store: &S, root: Address, key: &[u8], visit: F) -> Result<()>
where
    S: ChunkReader + ?Sized,
    F: FnMut(&[u8], Address) -> ControlFlow<()>,
{
    drive(iter_after(store, root, key)?, visit)
}

fn drive<S, F>(entries: Iter<'_, S>, mut visit: F) -> Result<()>
where
    S: ChunkReader + ?Sized,
    F: FnMut(&[u8], Address) -> ControlFlow<()>,
{
    for entry in entries {
        let (key, value) = entry?;
        if visit(&key, value).is_break() {
            break;
        }
    }
    Ok(())
}

/// Checks the weight rule and the stored counts of every node.
pub fn is_balanced<S: ChunkReader + ?Sized>(store: &S, root: Address) -> Result<bool> {
    fn check<S: ChunkReader + ?Sized>(store: &S, tree: Tree) -> Result<Option<u64>> {
        if tree.is_empty() {
            return Ok(Some(0));
        }
        let node = load_some(store, tree)?;
        let (left, right) = match (check(store, node.left)?, check(store, node.right)?) {
            (Some(l), Some(r)) => (l, r),
            _ => return Ok(None),
        };
        if left != node.left.count || right != node.right.count || !counts_balanced(left, right) {
            return Ok(None);
        }
        Ok(Some(1 + left + right))
    }
    Ok(check(store, root_tree(store, root)?)?.is_some())
}
