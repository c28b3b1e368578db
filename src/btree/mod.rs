//! The row B+tree: rows keyed by monotonically assigned 64-bit ids.
//!
//! Leaves hold full row cells and are threaded in key order through
//! `next_leaf`; internal nodes hold separators where every key reachable
//! through a cell's child is ≤ the cell's key. The root page index is fixed
//! at tree creation: splits and collapses move cells, never the root.

pub mod cursor;
pub mod delete;
pub mod insert;
pub mod overflow;
pub mod scan;


pub use cursor::Cursor;
pub use scan::RowScan;

use crate::config::MAX_TREE_DEPTH;
use crate::error::{Error, Result};
use crate::node::{internal_max_cells, leaf_max_cells, Node, NodeSpec};
use crate::txn::TxPager;
use crate::types::PageIndex;

/// Underflow floor: a non-root node must keep at least this many cells.
pub(crate) fn min_cells(max: usize) -> usize {
    max / 2
}

/// A handle to one table's row tree.
#[derive(Clone, Debug)]
pub struct RowTree {
    root: PageIndex,
    row_size: usize,
    leaf_max: usize,
    internal_max: usize,
}

impl RowTree {
    pub fn new(root: PageIndex, row_size: usize) -> Self {
        Self {
            root,
            row_size,
            leaf_max: leaf_max_cells(row_size),
            internal_max: internal_max_cells(),
        }
    }

    pub fn root(&self) -> PageIndex {
        self.root
    }

    pub fn row_size(&self) -> usize {
        self.row_size
    }

    pub(crate) fn spec(&self) -> NodeSpec {
        NodeSpec::Tree {
            row_size: self.row_size,
        }
    }

    pub(crate) fn leaf_max(&self) -> usize {
        self.leaf_max
    }

    pub(crate) fn internal_max(&self) -> usize {
        self.internal_max
    }

    /// Largest key currently in the tree, found by descending the rightmost
    /// path. Drives row id assignment on open.
    pub fn max_key(&self, txp: &mut TxPager<'_>) -> Result<Option<u64>> {
        let mut current = self.root;
        for _ in 0..MAX_TREE_DEPTH {
            match self.node(txp, current)? {
                Node::Leaf(leaf) => return Ok(leaf.last_key()),
                Node::Internal(node) => {
                    current = node.right_child.ok_or_else(|| {
                        Error::corrupt("btree.max_key", "internal node without right child")
                    })?;
                }
                other => {
                    return Err(Error::corrupt(
                        "btree.max_key",
                        format!("unexpected {} node in row tree", other.kind_name()),
                    ))
                }
            }
        }
        Err(Error::corrupt("btree.max_key", "tree deeper than the depth bound"))
    }

    /// Every page of this tree (root included), collected breadth-first.
    /// Used when a table is dropped to push its pages onto the free list.
    pub fn collect_pages(&self, txp: &mut TxPager<'_>) -> Result<Vec<PageIndex>> {
        let mut pages = Vec::new();
        let mut queue = std::collections::VecDeque::from([self.root]);
        while let Some(idx) = queue.pop_front() {
            if pages.len() > txp.total_pages() as usize {
                return Err(Error::corrupt(
                    "btree.collect_pages",
                    "more tree pages than pages in the file",
                ));
            }
            pages.push(idx);
            if let Node::Internal(node) = self.node(txp, idx)? {
                queue.extend(node.child_slots());
            }
        }
        Ok(pages)
    }

    /// Read a node of this tree through the transaction.
    pub(crate) fn node(&self, txp: &mut TxPager<'_>, idx: PageIndex) -> Result<Node> {
        txp.read_node(idx, self.spec())
    }

    /// Rewrite the parent pointer of every child of the internal node stored
    /// at `parent_idx`. Splits and merges migrate children between pages, so
    /// the back-pointers must follow.
    pub(crate) fn reparent_children(
        &self,
        txp: &mut TxPager<'_>,
        children: &[PageIndex],
        new_parent: PageIndex,
    ) -> Result<()> {
        for &child in children {
            let mut node = self.node(txp, child)?;
            node.set_parent(new_parent);
            txp.write_node(child, node)?;
        }
        Ok(())
    }
}
