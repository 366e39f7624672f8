use super::node::{load_some, root_tree, Node, Tree};
use crate::chunk::Address;
use crate::error::Result;
use crate::store::ChunkReader;

/// In-order traversal with an explicit stack of the pending ancestors.
pub struct Iter<'a, S: ?Sized> {
    store: &'a S,
    stack: Vec<Node>,
    failed: bool,
}

impl<'a, S: ChunkReader + ?Sized> Iter<'a, S> {
    pub(crate) fn new(store: &'a S, root: Address, after: Option<&[u8]>) -> Result<Self> {
        let tree = root_tree(store, root)?;
        Self::seek(store, tree, after)
    }

    pub(crate) fn from_tree(store: &'a S, tree: Tree) -> Result<Self> {
        Self::seek(store, tree, None)
    }

    /// Stacks the path to the first key greater than `after`.
    fn seek(store: &'a S, mut tree: Tree, after: Option<&[u8]>) -> Result<Self> {
        let mut stack = Vec::new();
        while !tree.is_empty() {
            let node = load_some(store, tree)?;
            match after {
                Some(key) if node.key.as_slice() <= key => tree = node.right,
                _ => {
                    tree = node.left;
                    stack.push(node);
                }
            }
        }
        Ok(Self {
            store,
            stack,
            failed: false,
        })
    }

    fn push_left(&mut self, mut tree: Tree) -> Result<()> {
        while !tree.is_empty() {
            let node = load_some(self.store, tree)?;
            tree = node.left;
            self.stack.push(node);
        }
        Ok(())
    }
}

impl<S: ChunkReader + ?Sized> Iterator for Iter<'_, S> {
    type Item = Result<(Vec<u8>, Address)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let node = self.stack.pop()?;
        if let Err(e) = self.push_left(node.right) {
            self.failed = true;
            return Some(Err(e));
        }
        Some(Ok((node.key, node.value)))
    }
}
