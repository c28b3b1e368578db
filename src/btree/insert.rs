//! Row insertion and node splitting.
//!
//! Splits propagate upward through the recursion's return value. The root
//! page never moves: when the root itself overflows, its left half migrates
//! to a fresh page and the root is rewritten as an internal node over the
//! two halves.

use log::debug;

use crate::error::{Error, Result};
use crate::node::{
    InternalCell, InternalNode, LeafCell, LeafNode, Node,
};
use crate::txn::TxPager;
use crate::types::PageIndex;

use super::RowTree;

enum InsertOutcome {
    Done,
    /// The child at this position split; `sep` bounds the keys left of
    /// `right`.
    Split { sep: u64, right: PageIndex },
}

impl RowTree {
    /// Insert a marshalled row cell. Keys are assigned monotonically by the
    /// table layer, so an existing key is a broken invariant, not an update.
    pub fn insert(&self, txp: &mut TxPager<'_>, cell: LeafCell) -> Result<()> {
        if cell.payload.len() != self.row_size() {
            return Err(Error::invariant(
                "btree.insert",
                format!(
                    "cell payload {} bytes, tree row size {}",
                    cell.payload.len(),
                    self.row_size()
                ),
            ));
        }
        match self.insert_into(txp, self.root(), cell)? {
            InsertOutcome::Done => Ok(()),
            InsertOutcome::Split { sep, right } => self.split_root(txp, sep, right),
        }
    }

    /// Rewrite the cell for `key` in place. The key and cell size are
    /// unchanged, so no rebalance can be needed.
    pub fn update(&self, txp: &mut TxPager<'_>, cell: LeafCell) -> Result<()> {
        let (cursor, found) = self.seek(txp, cell.key)?;
        if !found {
            return Err(Error::NotFound {
                what: format!("row {}", cell.key),
            });
        }
        let mut leaf = self.node(txp, cursor.page)?.into_leaf()?;
        leaf.cells[cursor.cell] = cell;
        txp.write_node(cursor.page, Node::Leaf(leaf))
    }

    fn insert_into(
        &self,
        txp: &mut TxPager<'_>,
        page: PageIndex,
        cell: LeafCell,
    ) -> Result<InsertOutcome> {
        match self.node(txp, page)? {
            Node::Leaf(mut leaf) => {
                let pos = match leaf.find(cell.key) {
                    Ok(_) => {
                        return Err(Error::invariant(
                            "btree.insert",
                            format!("key {} already present", cell.key),
                        ))
                    }
                    Err(pos) => pos,
                };
                leaf.cells.insert(pos, cell);
                if leaf.cells.len() <= self.leaf_max() {
                    txp.write_node(page, Node::Leaf(leaf))?;
                    return Ok(InsertOutcome::Done);
                }
                let (sep, right) = self.split_leaf(txp, page, leaf)?;
                Ok(InsertOutcome::Split { sep, right })
            }
            Node::Internal(mut node) => {
                let slot = node.index_of_child(cell.key);
                let child = node.child_at(slot)?;
                match self.insert_into(txp, child, cell)? {
                    InsertOutcome::Done => Ok(InsertOutcome::Done),
                    InsertOutcome::Split { sep, right } => {
                        if slot < node.cells.len() {
                            // The split child keeps its page as the left
                            // half; its old separator now bounds the right
                            // half.
                            let old_key = node.cells[slot].key;
                            node.cells[slot].key = sep;
                            node.cells.insert(
                                slot + 1,
                                InternalCell {
                                    key: old_key,
                                    child: right,
                                },
                            );
                        } else {
                            node.cells.push(InternalCell { key: sep, child });
                            node.right_child = Some(right);
                        }
                        if node.cells.len() <= self.internal_max() {
                            txp.write_node(page, Node::Internal(node))?;
                            return Ok(InsertOutcome::Done);
                        }
                        let (sep, right) = self.split_internal(txp, page, node)?;
                        Ok(InsertOutcome::Split { sep, right })
                    }
                }
            }
            other => Err(Error::corrupt(
                "btree.insert",
                format!("unexpected {} node in row tree", other.kind_name()),
            )),
        }
    }

    /// Split an overfull leaf, left-biased, patching the leaf chain.
    fn split_leaf(
        &self,
        txp: &mut TxPager<'_>,
        page: PageIndex,
        mut leaf: LeafNode,
    ) -> Result<(u64, PageIndex)> {
        let keep = (leaf.cells.len() + 1) / 2;
        let right_cells = leaf.cells.split_off(keep);
        let right_page = txp.get_free_page()?;

        let right = LeafNode {
            is_root: false,
            parent: leaf.parent,
            next_leaf: leaf.next_leaf,
            row_size: leaf.row_size,
            cells: right_cells,
        };
        leaf.next_leaf = right_page;
        let sep = leaf
            .last_key()
            .ok_or_else(|| Error::invariant("btree.split_leaf", "left half is empty"))?;

        debug!(
            "leaf {} split: {} cells kept, {} moved to {}",
            page,
            leaf.cells.len(),
            right.cells.len(),
            right_page
        );
        txp.write_node(page, Node::Leaf(leaf))?;
        txp.write_node(right_page, Node::Leaf(right))?;
        Ok((sep, right_page))
    }

    /// Split an overfull internal node around its median separator.
    fn split_internal(
        &self,
        txp: &mut TxPager<'_>,
        page: PageIndex,
        mut node: InternalNode,
    ) -> Result<(u64, PageIndex)> {
        let mid = node.cells.len() / 2;
        let sep = node.cells[mid].key;
        let right_cells: Vec<InternalCell> = node.cells.split_off(mid + 1);
        let median = node.cells.pop().expect("median cell");

        let right_page = txp.get_free_page()?;
        let right = InternalNode {
            is_root: false,
            parent: node.parent,
            cells: right_cells,
            right_child: node.right_child,
        };
        node.right_child = Some(median.child);

        // Children that migrated to the new page need their back-pointers
        // rewritten.
        let migrated = right.child_slots();
        debug!(
            "internal {} split at key {}: {} children moved to {}",
            page,
            sep,
            migrated.len(),
            right_page
        );
        txp.write_node(page, Node::Internal(node))?;
        txp.write_node(right_page, Node::Internal(right))?;
        self.reparent_children(txp, &migrated, right_page)?;
        Ok((sep, right_page))
    }

    /// The root split: move its left half to a fresh page and turn the root
    /// into an internal node over the two halves. The root page index stays
    /// fixed for the life of the tree.
    fn split_root(
        &self,
        txp: &mut TxPager<'_>,
        sep: u64,
        right: PageIndex,
    ) -> Result<()> {
        let root_idx = self.root();
        let left_page = txp.get_free_page()?;

        let mut left = self.node(txp, root_idx)?;
        left.set_is_root(false);
        left.set_parent(root_idx);
        if let Node::Internal(ref n) = left {
            let children = n.child_slots();
            self.reparent_children(txp, &children, left_page)?;
        }
        txp.write_node(left_page, left)?;

        let mut right_node = self.node(txp, right)?;
        right_node.set_parent(root_idx);
        txp.write_node(right, right_node)?;

        let new_root = InternalNode {
            is_root: true,
            parent: PageIndex(0),
            cells: vec![InternalCell {
                key: sep,
                child: left_page,
            }],
            right_child: Some(right),
        };
        debug!(
            "root {} split into {} and {} around key {}",
            root_idx, left_page, right, sep
        );
        txp.write_node(root_idx, Node::Internal(new_root))
    }
}
