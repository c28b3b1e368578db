//! Index deletion and rebalancing.
//!
//! A key found in an internal node is first swapped with its in-order
//! predecessor (the greatest key of the lesser subtree), reducing every
//! deletion to a leaf deletion. Underflow then borrows through the parent
//! separator cell or merges, preferring the left sibling, and an empty
//! internal root collapses into its last child.

use log::debug;

use crate::error::{Error, Result};
use crate::node::{IndexCell, IndexNode, Node};
use crate::txn::TxPager;
use crate::types::PageIndex;

use super::{IndexKey, IndexTree};

impl IndexTree {
    /// Remove `key` from the index.
    pub fn delete(&self, txp: &mut TxPager<'_>, key: &IndexKey) -> Result<()> {
        let mut current = self.root();
        for _ in 0..crate::config::MAX_TREE_DEPTH {
            let mut node = self.node(txp, current)?;
            match node.find(key) {
                Ok(pos) if node.is_leaf => {
                    node.cells.remove(pos);
                    txp.write_node(current, Node::Index(node))?;
                    return self.rebalance(txp, current);
                }
                Ok(pos) => {
                    // Swap with the predecessor from the lesser subtree,
                    // then delete that predecessor from its leaf.
                    let subtree = node.cells[pos].child;
                    let (leaf_idx, pred) = self.take_predecessor(txp, subtree)?;
                    node.cells[pos].key = pred.key;
                    node.cells[pos].row_id = pred.row_id;
                    txp.write_node(current, Node::Index(node))?;
                    return self.rebalance(txp, leaf_idx);
                }
                Err(pos) => {
                    if node.is_leaf {
                        return Err(Error::NotFound {
                            what: format!("key {:?} in index '{}'", key, self.name()),
                        });
                    }
                    current = node.child_at(pos)?;
                }
            }
        }
        Err(Error::corrupt("index.delete", "tree deeper than the depth bound"))
    }

    /// Remove and return the greatest cell of the subtree rooted at `idx`.
    fn take_predecessor(
        &self,
        txp: &mut TxPager<'_>,
        mut idx: PageIndex,
    ) -> Result<(PageIndex, IndexCell)> {
        for _ in 0..crate::config::MAX_TREE_DEPTH {
            let mut node = self.node(txp, idx)?;
            if node.is_leaf {
                let cell = node.cells.pop().ok_or_else(|| {
                    Error::corrupt("index.predecessor", "empty leaf on the rightmost path")
                })?;
                txp.write_node(idx, Node::Index(node))?;
                return Ok((idx, cell));
            }
            idx = node.right_child.ok_or_else(|| {
                Error::corrupt("index.predecessor", "internal node without right child")
            })?;
        }
        Err(Error::corrupt(
            "index.predecessor",
            "tree deeper than the depth bound",
        ))
    }

    fn rebalance(&self, txp: &mut TxPager<'_>, page: PageIndex) -> Result<()> {
        let node = self.node(txp, page)?;
        if node.is_root {
            return self.maybe_collapse_root(txp, node);
        }
        if node.cells.len() >= self.min_cells() {
            return Ok(());
        }
        self.rebalance_node(txp, page, node)
    }

    fn rebalance_node(
        &self,
        txp: &mut TxPager<'_>,
        page: PageIndex,
        mut node: IndexNode,
    ) -> Result<()> {
        let parent_idx = node.parent;
        let mut parent = self.node(txp, parent_idx)?;
        let slot = parent.slot_of_child(page)?;

        let left_idx = if slot > 0 {
            Some(parent.child_at(slot - 1)?)
        } else {
            None
        };
        let right_idx = if slot < parent.cells.len() {
            Some(parent.child_at(slot + 1)?)
        } else {
            None
        };
        let left = left_idx.map(|i| self.node(txp, i)).transpose()?;
        let right = right_idx.map(|i| self.node(txp, i)).transpose()?;

        let floor = self.min_cells();
        let lend_left = left.as_ref().map(|n| n.cells.len()).filter(|&n| n > floor);
        let lend_right = right.as_ref().map(|n| n.cells.len()).filter(|&n| n > floor);

        match (lend_left, lend_right) {
            (Some(a), Some(b)) if b > a => {
                let right_idx = right_idx.expect("right donor index");
                let right = right.expect("right donor");
                self.borrow_right(txp, page, node, parent_idx, parent, slot, right_idx, right)
            }
            (Some(_), _) => {
                let left_idx = left_idx.expect("left donor index");
                let left = left.expect("left donor");
                self.borrow_left(txp, page, node, parent_idx, parent, slot, left_idx, left)
            }
            (None, Some(_)) => {
                let right_idx = right_idx.expect("right donor index");
                let right = right.expect("right donor");
                self.borrow_right(txp, page, node, parent_idx, parent, slot, right_idx, right)
            }
            (None, None) => {
                if let (Some(survivor), Some(survivor_idx)) = (left, left_idx) {
                    debug!("index node {} merges into left {}", page, survivor_idx);
                    self.merge(txp, survivor_idx, survivor, page, node, parent_idx, parent, slot - 1)?;
                } else if let (Some(victim), Some(victim_idx)) = (right, right_idx) {
                    debug!("index node {} absorbs right {}", page, victim_idx);
                    self.merge(txp, page, node, victim_idx, victim, parent_idx, parent, slot)?;
                } else {
                    return Err(Error::invariant(
                        "index.rebalance",
                        format!("node {} has no siblings under {}", page, parent_idx),
                    ));
                }
                self.rebalance(txp, parent_idx)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn borrow_left(
        &self,
        txp: &mut TxPager<'_>,
        page: PageIndex,
        mut node: IndexNode,
        parent_idx: PageIndex,
        mut parent: IndexNode,
        slot: usize,
        left_idx: PageIndex,
        mut left: IndexNode,
    ) -> Result<()> {
        let donated = left.cells.pop().ok_or_else(|| {
            Error::invariant("index.borrow", "left donor has no cells")
        })?;
        let sep = &mut parent.cells[slot - 1];
        debug!("index node {} borrows {:?} via parent from {}", page, donated.key, left_idx);

        // The separator rotates down in front of the node; the donor's last
        // cell rotates up into the separator slot. For internal nodes the
        // donor's right child migrates along.
        let moved_child = if node.is_leaf {
            PageIndex(0)
        } else {
            let mc = left.right_child.ok_or_else(|| {
                Error::invariant("index.borrow", "internal donor without right child")
            })?;
            left.right_child = Some(donated.child);
            mc
        };
        node.cells.insert(
            0,
            IndexCell {
                key: sep.key.clone(),
                row_id: sep.row_id,
                child: moved_child,
            },
        );
        sep.key = donated.key;
        sep.row_id = donated.row_id;

        txp.write_node(left_idx, Node::Index(left))?;
        if !node.is_leaf {
            self.reparent_children(txp, &[moved_child], page)?;
        }
        txp.write_node(page, Node::Index(node))?;
        txp.write_node(parent_idx, Node::Index(parent))
    }

    #[allow(clippy::too_many_arguments)]
    fn borrow_right(
        &self,
        txp: &mut TxPager<'_>,
        page: PageIndex,
        mut node: IndexNode,
        parent_idx: PageIndex,
        mut parent: IndexNode,
        slot: usize,
        right_idx: PageIndex,
        mut right: IndexNode,
    ) -> Result<()> {
        if right.cells.is_empty() {
            return Err(Error::invariant("index.borrow", "right donor has no cells"));
        }
        let donated = right.cells.remove(0);
        let sep = &mut parent.cells[slot];
        debug!("index node {} borrows {:?} via parent from {}", page, donated.key, right_idx);

        let moved_child = donated.child;
        node.cells.push(IndexCell {
            key: sep.key.clone(),
            row_id: sep.row_id,
            child: if node.is_leaf {
                PageIndex(0)
            } else {
                node.right_child.ok_or_else(|| {
                    Error::invariant("index.borrow", "internal node without right child")
                })?
            },
        });
        if !node.is_leaf {
            node.right_child = Some(moved_child);
        }
        sep.key = donated.key;
        sep.row_id = donated.row_id;

        txp.write_node(right_idx, Node::Index(right))?;
        if !node.is_leaf {
            self.reparent_children(txp, &[moved_child], page)?;
        }
        txp.write_node(page, Node::Index(node))?;
        txp.write_node(parent_idx, Node::Index(parent))
    }

    /// Merge `victim` into `survivor` (its left neighbor), absorbing the
    /// separator cell between them, then drop the victim's slot from the
    /// parent and free its page.
    #[allow(clippy::too_many_arguments)]
    fn merge(
        &self,
        txp: &mut TxPager<'_>,
        survivor_idx: PageIndex,
        mut survivor: IndexNode,
        victim_idx: PageIndex,
        mut victim: IndexNode,
        parent_idx: PageIndex,
        mut parent: IndexNode,
        sep_pos: usize,
    ) -> Result<()> {
        let sep = &parent.cells[sep_pos];
        let sep_child = if survivor.is_leaf {
            PageIndex(0)
        } else {
            survivor.right_child.ok_or_else(|| {
                Error::invariant("index.merge", "internal survivor without right child")
            })?
        };
        survivor.cells.push(IndexCell {
            key: sep.key.clone(),
            row_id: sep.row_id,
            child: sep_child,
        });
        let migrated = victim.child_slots();
        survivor.cells.append(&mut victim.cells);
        survivor.right_child = victim.right_child;

        // Drop the separator and the victim's child slot; the survivor now
        // covers the combined range.
        parent.cells.remove(sep_pos);
        if sep_pos < parent.cells.len() {
            parent.cells[sep_pos].child = survivor_idx;
        } else {
            parent.right_child = Some(survivor_idx);
        }

        txp.write_node(survivor_idx, Node::Index(survivor))?;
        self.reparent_children(txp, &migrated, survivor_idx)?;
        txp.write_node(parent_idx, Node::Index(parent))?;
        txp.add_free_page(victim_idx)
    }

    /// An internal root with no cells left: its single child's contents move
    /// into the root page.
    fn maybe_collapse_root(&self, txp: &mut TxPager<'_>, root: IndexNode) -> Result<()> {
        if root.is_leaf || !root.cells.is_empty() {
            return Ok(());
        }
        let child_idx = root.right_child.ok_or_else(|| {
            Error::corrupt("index.collapse", "empty index root without right child")
        })?;
        let mut child = self.node(txp, child_idx)?;
        child.is_root = true;
        child.parent = PageIndex(0);
        let grandchildren = child.child_slots();
        self.reparent_children(txp, &grandchildren, self.root())?;
        debug!("index root {} collapses child {}", self.root(), child_idx);
        txp.write_node(self.root(), Node::Index(child))?;
        txp.add_free_page(child_idx)
    }
}
