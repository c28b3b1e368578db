//! Index insertion and node splitting.
//!
//! B-tree splits promote the median cell: the left half keeps the original
//! page, the right half moves to a fresh one, and the median (key + row id)
//! climbs into the parent pointing at the left half. The root page stays
//! fixed; a root split migrates its left half out first.

use log::debug;

use crate::error::Result;
use crate::node::{IndexCell, IndexNode, Node};
use crate::txn::TxPager;
use crate::types::PageIndex;

use super::{IndexKey, IndexTree};

enum InsertOutcome {
    Done,
    /// The child split; `median.child` already names the surviving left
    /// half, `right` the new page holding greater keys.
    Split { median: IndexCell, right: PageIndex },
}

impl IndexTree {
    /// Map `key` to `row_id`, rejecting duplicates.
    pub fn insert(&self, txp: &mut TxPager<'_>, key: IndexKey, row_id: u64) -> Result<()> {
        match self.insert_into(txp, self.root(), key, row_id)? {
            InsertOutcome::Done => Ok(()),
            InsertOutcome::Split { median, right } => self.split_root(txp, median, right),
        }
    }

    fn insert_into(
        &self,
        txp: &mut TxPager<'_>,
        page: PageIndex,
        key: IndexKey,
        row_id: u64,
    ) -> Result<InsertOutcome> {
        let mut node = self.node(txp, page)?;
        let pos = match node.find(&key) {
            Ok(_) => return Err(self.duplicate()),
            Err(pos) => pos,
        };

        if node.is_leaf {
            node.cells.insert(
                pos,
                IndexCell {
                    key,
                    row_id,
                    child: PageIndex(0),
                },
            );
            if node.cells.len() <= self.max_cells() {
                txp.write_node(page, Node::Index(node))?;
                return Ok(InsertOutcome::Done);
            }
            let (median, right) = self.split_node(txp, page, node)?;
            return Ok(InsertOutcome::Split { median, right });
        }

        let child = node.child_at(pos)?;
        match self.insert_into(txp, child, key, row_id)? {
            InsertOutcome::Done => Ok(InsertOutcome::Done),
            InsertOutcome::Split { median, right } => {
                // The median arrives pointing at the surviving left half;
                // the displaced reference to the split child now covers the
                // greater keys and must point at the right half.
                if pos < node.cells.len() {
                    node.cells.insert(pos, median);
                    node.cells[pos + 1].child = right;
                } else {
                    node.cells.push(median);
                    node.right_child = Some(right);
                }
                if node.cells.len() <= self.max_cells() {
                    txp.write_node(page, Node::Index(node))?;
                    return Ok(InsertOutcome::Done);
                }
                let (median, right) = self.split_node(txp, page, node)?;
                Ok(InsertOutcome::Split { median, right })
            }
        }
    }

    /// Split an overfull node around its median cell, left-biased.
    fn split_node(
        &self,
        txp: &mut TxPager<'_>,
        page: PageIndex,
        mut node: IndexNode,
    ) -> Result<(IndexCell, PageIndex)> {
        let mid = node.cells.len() / 2;
        let right_cells: Vec<IndexCell> = node.cells.split_off(mid + 1);
        let mut median = node.cells.pop().expect("median cell");

        let right_page = txp.get_free_page()?;
        let right = IndexNode {
            is_root: false,
            is_leaf: node.is_leaf,
            parent: node.parent,
            key_size: node.key_size,
            cells: right_cells,
            right_child: node.right_child,
        };
        if !node.is_leaf {
            node.right_child = Some(median.child);
        }
        median.child = page;

        let migrated = right.child_slots();
        debug!(
            "index node {} split: median {:?}, {} cells moved to {}",
            page,
            median.key,
            right.cells.len(),
            right_page
        );
        txp.write_node(page, Node::Index(node))?;
        txp.write_node(right_page, Node::Index(right))?;
        self.reparent_children(txp, &migrated, right_page)?;
        Ok((median, right_page))
    }

    /// Root split with the root page fixed in place: the left half moves to
    /// a fresh page and the root becomes internal over the two halves.
    fn split_root(
        &self,
        txp: &mut TxPager<'_>,
        mut median: IndexCell,
        right: PageIndex,
    ) -> Result<()> {
        let root_idx = self.root();
        let left_page = txp.get_free_page()?;

        let mut left = self.node(txp, root_idx)?;
        left.is_root = false;
        left.parent = root_idx;
        let left_children = left.child_slots();
        self.reparent_children(txp, &left_children, left_page)?;
        let key_size = left.key_size;
        txp.write_node(left_page, Node::Index(left))?;

        let mut right_node = self.node(txp, right)?;
        right_node.parent = root_idx;
        txp.write_node(right, Node::Index(right_node))?;

        median.child = left_page;
        let new_root = IndexNode {
            is_root: true,
            is_leaf: false,
            parent: PageIndex(0),
            key_size,
            cells: vec![median],
            right_child: Some(right),
        };
        debug!(
            "index root {} split into {} and {}",
            root_idx, left_page, right
        );
        txp.write_node(root_idx, Node::Index(new_root))
    }
}

#[cfg(test)]
use crate::error::Error;

impl IndexTree {
    /// Internal consistency probe shared by tests: an error describing the
    /// first violated structural rule, if any.
    #[cfg(test)]
    pub(crate) fn check_structure(&self, txp: &mut TxPager<'_>) -> Result<()> {
        self.check_subtree(txp, self.root(), None, None, None)
    }

    #[cfg(test)]
    fn check_subtree(
        &self,
        txp: &mut TxPager<'_>,
        idx: PageIndex,
        parent: Option<PageIndex>,
        lower: Option<&IndexKey>,
        upper: Option<&IndexKey>,
    ) -> Result<()> {
        let node = self.node(txp, idx)?;
        if let Some(p) = parent {
            if node.parent != p {
                return Err(Error::invariant(
                    "index.check",
                    format!("node {} parent {} should be {}", idx, node.parent, p),
                ));
            }
            if node.cells.len() < self.min_cells() {
                return Err(Error::invariant(
                    "index.check",
                    format!("node {} below half-full: {} cells", idx, node.cells.len()),
                ));
            }
        }
        for pair in node.cells.windows(2) {
            if pair[0].key >= pair[1].key {
                return Err(Error::invariant(
                    "index.check",
                    format!("node {} keys not strictly ascending", idx),
                ));
            }
        }
        if let (Some(lo), Some(first)) = (lower, node.cells.first()) {
            if first.key <= *lo {
                return Err(Error::invariant(
                    "index.check",
                    format!("node {} key below subtree bound", idx),
                ));
            }
        }
        if let (Some(hi), Some(last)) = (upper, node.cells.last()) {
            if last.key >= *hi {
                return Err(Error::invariant(
                    "index.check",
                    format!("node {} key above subtree bound", idx),
                ));
            }
        }
        if !node.is_leaf {
            let mut low = lower.cloned();
            for cell in &node.cells {
                self.check_subtree(txp, cell.child, Some(idx), low.as_ref(), Some(&cell.key))?;
                low = Some(cell.key.clone());
            }
            let rc = node.right_child.ok_or_else(|| {
                Error::invariant("index.check", format!("node {} missing right child", idx))
            })?;
            self.check_subtree(txp, rc, Some(idx), low.as_ref(), upper)?;
        }
        Ok(())
    }
}
