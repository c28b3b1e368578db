//! The unique-key index: a B-tree mapping a typed column value to a row id.
//!
//! Unlike the row tree, keys live in internal nodes too (every key appears
//! exactly once in the whole tree) and leaves are not chained. A cell's
//! child subtree holds strictly smaller keys; the right child holds larger
//! ones. Duplicate keys are rejected.

pub mod delete;
pub mod insert;
pub mod key;

#[cfg(test)]
mod tests;

pub use key::IndexKey;

use crate::config::MAX_TREE_DEPTH;
use crate::error::{Error, Result};
use crate::node::{index_max_cells, IndexNode, Node, NodeSpec};
use crate::schema::ColumnKind;
use crate::txn::TxPager;
use crate::types::PageIndex;

/// A handle to one primary-key index.
#[derive(Clone, Debug)]
pub struct IndexTree {
    root: PageIndex,
    name: String,
    kind: ColumnKind,
    key_size: usize,
    max_cells: usize,
}

impl IndexTree {
    pub fn new(root: PageIndex, name: impl Into<String>, kind: ColumnKind, key_size: usize) -> Self {
        Self {
            root,
            name: name.into(),
            kind,
            key_size,
            max_cells: index_max_cells(key_size),
        }
    }

    /// Force a low fan-out for deterministic split and merge coverage.
    /// Only tests use this; production capacity derives from the key width.
    pub fn with_maximum_keys(mut self, maximum_keys: usize) -> Self {
        self.max_cells = maximum_keys;
        self
    }

    pub fn root(&self) -> PageIndex {
        self.root
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ColumnKind {
        self.kind
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub(crate) fn spec(&self) -> NodeSpec {
        NodeSpec::Index {
            kind: self.kind,
            key_size: self.key_size,
        }
    }

    pub(crate) fn max_cells(&self) -> usize {
        self.max_cells
    }

    pub(crate) fn min_cells(&self) -> usize {
        self.max_cells / 2
    }

    pub(crate) fn node(&self, txp: &mut TxPager<'_>, idx: PageIndex) -> Result<IndexNode> {
        txp.read_node(idx, self.spec())?.into_index()
    }

    pub(crate) fn duplicate(&self) -> Error {
        Error::DuplicateKey {
            index: self.name.clone(),
        }
    }

    /// Look up the row id stored for `key`.
    pub fn find(&self, txp: &mut TxPager<'_>, key: &IndexKey) -> Result<u64> {
        let mut current = self.root;
        for _ in 0..MAX_TREE_DEPTH {
            let node = self.node(txp, current)?;
            match node.find(key) {
                Ok(i) => return Ok(node.cells[i].row_id),
                Err(i) => {
                    if node.is_leaf {
                        return Err(Error::NotFound {
                            what: format!("key {:?} in index '{}'", key, self.name),
                        });
                    }
                    current = node.child_at(i)?;
                }
            }
        }
        Err(Error::corrupt("index.find", "tree deeper than the depth bound"))
    }

    /// The greatest key in the index and its row id, by rightmost descent.
    pub fn seek_last_key(&self, txp: &mut TxPager<'_>) -> Result<Option<(IndexKey, u64)>> {
        let mut current = self.root;
        for _ in 0..MAX_TREE_DEPTH {
            let node = self.node(txp, current)?;
            if node.is_leaf {
                return Ok(node.cells.last().map(|c| (c.key.clone(), c.row_id)));
            }
            current = node.right_child.ok_or_else(|| {
                Error::corrupt("index.seek_last", "internal index node without right child")
            })?;
        }
        Err(Error::corrupt(
            "index.seek_last",
            "tree deeper than the depth bound",
        ))
    }

    /// Every key in the tree, collected breadth-first. Exercised by tests
    /// that pin the split and merge shapes.
    pub fn keys_bfs(&self, txp: &mut TxPager<'_>) -> Result<Vec<IndexKey>> {
        let mut keys = Vec::new();
        let mut queue = std::collections::VecDeque::from([self.root]);
        let mut visited = 0u32;
        while let Some(idx) = queue.pop_front() {
            visited += 1;
            if visited > txp.total_pages() {
                return Err(Error::corrupt(
                    "index.bfs",
                    "more index pages than pages in the file",
                ));
            }
            let node = self.node(txp, idx)?;
            keys.extend(node.cells.iter().map(|c| c.key.clone()));
            queue.extend(node.child_slots());
        }
        Ok(keys)
    }

    /// Every page of this index, for drop-table freeing.
    pub fn collect_pages(&self, txp: &mut TxPager<'_>) -> Result<Vec<PageIndex>> {
        let mut pages = Vec::new();
        let mut queue = std::collections::VecDeque::from([self.root]);
        while let Some(idx) = queue.pop_front() {
            if pages.len() > txp.total_pages() as usize {
                return Err(Error::corrupt(
                    "index.collect_pages",
                    "more index pages than pages in the file",
                ));
            }
            pages.push(idx);
            let node = self.node(txp, idx)?;
            queue.extend(node.child_slots());
        }
        Ok(pages)
    }

    /// Rewrite the parent pointers of children migrated to another page.
    pub(crate) fn reparent_children(
        &self,
        txp: &mut TxPager<'_>,
        children: &[PageIndex],
        new_parent: PageIndex,
    ) -> Result<()> {
        for &child in children {
            let mut node = self.node(txp, child)?;
            node.parent = new_parent;
            txp.write_node(child, Node::Index(node))?;
        }
        Ok(())
    }
}
