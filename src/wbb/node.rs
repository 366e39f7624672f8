use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::chunk::{Address, ChunkType};
use crate::error::{Error, Result};
use crate::store::{ChunkReader, ChunkWriter};

const COUNTS_LEN: usize = 16;

/// A subtree handle: its root address (`NIL` when empty) and entry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tree {
    pub addr: Address,
    pub count: u64,
}

impl Tree {
    pub const EMPTY: Tree = Tree {
        addr: Address::NIL,
        count: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.addr.is_nil()
    }
}

/// Decoded tree node.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub key: Vec<u8>,
    pub value: Address,
    pub left: Tree,
    pub right: Tree,
}

impl Node {
    pub fn count(&self) -> u64 {
        1 + self.left.count + self.right.count
    }
}

/// Loads a node; `None` for the empty-map chunk.
pub(crate) fn load<S: ChunkReader + ?Sized>(store: &S, addr: Address) -> Result<Option<Node>> {
    let bytes = store.chunk(addr)?;
    let chunk = bytes.decode()?;
    if chunk.kind != ChunkType::WbbNode {
        return Err(Error::NotMap);
    }
    if chunk.refs.is_empty() && chunk.data.is_empty() {
        return Ok(None);
    }
    if chunk.refs.len() != 3 || chunk.data.len() < COUNTS_LEN {
        return Err(Error::InvalidChunk(format!(
            "map node at {:?} has {} refs and {} payload bytes",
            addr,
            chunk.refs.len(),
            chunk.data.len()
        )));
    }
    let refs = chunk.refs;
    let (value, left, right) = match (refs.get(0), refs.get(1), refs.get(2)) {
        (Some(v), Some(l), Some(r)) => (v, l, r),
        _ => return Err(Error::InvalidChunk(format!("map node at {:?} lost a ref", addr))),
    };
    let left_count = BigEndian::read_u64(&chunk.data[0..8]);
    let right_count = BigEndian::read_u64(&chunk.data[8..16]);
    if left.is_nil() != (left_count == 0) || right.is_nil() != (right_count == 0) {
        return Err(Error::InvalidChunk(format!(
            "map node at {:?} has counts that disagree with its children",
            addr
        )));
    }
    Ok(Some(Node {
        key: chunk.data[COUNTS_LEN..].to_vec(),
        value,
        left: Tree {
            addr: left,
            count: left_count,
        },
        right: Tree {
            addr: right,
            count: right_count,
        },
    }))
}

/// Loads a node that must exist.
pub(crate) fn load_some<S: ChunkReader + ?Sized>(store: &S, tree: Tree) -> Result<Node> {
    load(store, tree.addr)?.ok_or_else(|| {
        Error::InvalidChunk(format!("empty map chunk {:?} used as a subtree", tree.addr))
    })
}

/// Subtree handle of a map root, which may be the empty-map chunk.
pub(crate) fn root_tree<S: ChunkReader + ?Sized>(store: &S, root: Address) -> Result<Tree> {
    Ok(match load(store, root)? {
        Some(node) => Tree {
            addr: root,
            count: node.count(),
        },
        None => Tree::EMPTY,
    })
}

pub(crate) fn write_empty<S: ChunkWriter + ?Sized>(store: &S) -> Result<Address> {
    store.write_chunk(ChunkType::WbbNode, &[], &[])
}

pub(crate) fn write<S: ChunkWriter + ?Sized>(
    store: &S,
    key: &[u8],
    value: Address,
    left: Tree,
    right: Tree,
) -> Result<Tree> {
    let mut payload = Vec::with_capacity(COUNTS_LEN + key.len());
    payload.write_u64::<BigEndian>(left.count)?;
    payload.write_u64::<BigEndian>(right.count)?;
    payload.extend_from_slice(key);
    let addr = store.write_chunk(ChunkType::WbbNode, &[value, left.addr, right.addr], &payload)?;
    Ok(Tree {
        addr,
        count: 1 + left.count + right.count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Layer;
    use crate::store::MemStore;

    #[test]
    fn test_node_round_trip() {
        let store = MemStore::new();
        let value = store.write_chunk(ChunkType::DataLeaf, &[], b"v").unwrap();
        let leaf = write(&store, b"a", value, Tree::EMPTY, Tree::EMPTY).unwrap();
        let root = write(&store, b"b", value, leaf, Tree::EMPTY).unwrap();
        assert_eq!(root.count, 2);

        let node = load(&store, root.addr).unwrap().unwrap();
        assert_eq!(node.key, b"b");
        assert_eq!(node.value, value);
        assert_eq!(node.left, leaf);
        assert!(node.right.is_empty());
    }

    #[test]
    fn test_empty_map_chunk() {
        let store = MemStore::new();
        let empty = write_empty(&store).unwrap();
        assert!(load(&store, empty).unwrap().is_none());
        assert_eq!(root_tree(&store, empty).unwrap(), Tree::EMPTY);
    }

    #[test]
    fn test_other_types_are_not_maps() {
        let store = MemStore::new();
        let leaf = store.write_chunk(ChunkType::ArrayLeaf, &[], &[]).unwrap();
        assert!(matches!(load(&store, leaf), Err(Error::NotMap)));

        let bogus = Address::new(Layer::Durable, 0);
        let bad = store
            .write_chunk(ChunkType::WbbNode, &[bogus, Address::NIL, Address::NIL], &[0; 16])
            .unwrap();
        assert!(load(&store, bad).unwrap().is_some());
        let broken = store
            .write_chunk(ChunkType::WbbNode, &[bogus, bogus, Address::NIL], &[0; 16])
            .unwrap();
        assert!(matches!(load(&store, broken), Err(Error::InvalidChunk(_))));
    }
}
