use super::{load, Loaded, Node, FANOUT};
use crate::chunk::Address;
use crate::error::Result;
use crate::store::ChunkReader;

/// Walks the elements from index 0 upwards.
pub struct Iter<'a, S: ?Sized> {
    store: &'a S,
    stack: Vec<(Node, usize)>,
    leaf: std::vec::IntoIter<Address>,
    failed: bool,
}

impl<'a, S: ChunkReader + ?Sized> Iter<'a, S> {
    pub(crate) fn new(store: &'a S, root: Address) -> Result<Self> {
        let mut iter = Self {
            store,
            stack: Vec::new(),
            leaf: Vec::new().into_iter(),
            failed: false,
        };
        iter.enter(root)?;
        Ok(iter)
    }

    fn enter(&mut self, addr: Address) -> Result<()> {
        match load(self.store, addr)? {
            Loaded::Leaf(elements) => self.leaf = elements.into_iter(),
            Loaded::Node(node) => self.stack.push((node, 0)),
        }
        Ok(())
    }
}

impl<S: ChunkReader + ?Sized> Iterator for Iter<'_, S> {
    type Item = Result<Address>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(element) = self.leaf.next() {
                return Some(Ok(element));
            }
            let (node, next) = self.stack.last_mut()?;
            match (*next..FANOUT).find(|b| node.sizes[*b] > 0) {
                Some(bucket) => {
                    *next = bucket + 1;
                    let child = node.children[bucket];
                    if let Err(e) = self.enter(child) {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}
