//! Row deletion and tree rebalancing.
//!
//! After a cell is removed, an underflowing leaf first tries to borrow from
//! the sibling with the greater surplus, rotating the parent separator;
//! otherwise it merges, preferring the left sibling so the leaf chain keeps
//! scan order. Internal underflow recurses with the same shape, and a root
//! left with a single child collapses into the root page.

use log::debug;

use crate::error::{Error, Result};
use crate::node::{InternalNode, LeafCell, LeafNode, Node};
use crate::txn::TxPager;
use crate::types::PageIndex;

use super::{min_cells, RowTree};

impl RowTree {
    /// Remove the cell for `key` and rebalance. Returns the removed cell so
    /// the caller can free any overflow chains it references.
    pub fn delete(&self, txp: &mut TxPager<'_>, key: u64) -> Result<LeafCell> {
        let (cursor, found) = self.seek(txp, key)?;
        if !found {
            return Err(Error::NotFound {
                what: format!("row {}", key),
            });
        }
        let mut leaf = self.node(txp, cursor.page)?.into_leaf()?;
        let removed = leaf.cells.remove(cursor.cell);
        txp.write_node(cursor.page, Node::Leaf(leaf))?;
        self.rebalance(txp, cursor.page)?;
        Ok(removed)
    }

    fn rebalance(&self, txp: &mut TxPager<'_>, page: PageIndex) -> Result<()> {
        match self.node(txp, page)? {
            Node::Leaf(leaf) => {
                if leaf.is_root || leaf.cells.len() >= min_cells(self.leaf_max()) {
                    return Ok(());
                }
                self.rebalance_leaf(txp, page, leaf)
            }
            Node::Internal(node) => {
                if node.is_root {
                    return self.maybe_collapse_root(txp, node);
                }
                if node.cells.len() >= min_cells(self.internal_max()) {
                    return Ok(());
                }
                self.rebalance_internal(txp, page, node)
            }
            other => Err(Error::corrupt(
                "btree.rebalance",
                format!("unexpected {} node in row tree", other.kind_name()),
            )),
        }
    }

    fn rebalance_leaf(
        &self,
        txp: &mut TxPager<'_>,
        page: PageIndex,
        mut leaf: LeafNode,
    ) -> Result<()> {
        let parent_idx = leaf.parent;
        let mut parent = self.node(txp, parent_idx)?.into_internal()?;
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
        let left = left_idx
            .map(|i| self.node(txp, i).and_then(Node::into_leaf))
            .transpose()?;
        let right = right_idx
            .map(|i| self.node(txp, i).and_then(Node::into_leaf))
            .transpose()?;

        let floor = min_cells(self.leaf_max());
        match pick_donor(
            left.as_ref().map(|n| n.cells.len()),
            right.as_ref().map(|n| n.cells.len()),
            floor,
        ) {
            Some(Donor::Left) => {
                let mut left_node = left.expect("left donor");
                let left_idx = left_idx.expect("left donor index");
                let moved = left_node.cells.pop().expect("donor cell");
                debug!("leaf {} borrows key {} from left {}", page, moved.key, left_idx);
                leaf.cells.insert(0, moved);
                parent.cells[slot - 1].key = left_node
                    .last_key()
                    .ok_or_else(|| Error::invariant("btree.borrow", "left donor drained"))?;
                txp.write_node(left_idx, Node::Leaf(left_node))?;
                txp.write_node(page, Node::Leaf(leaf))?;
                txp.write_node(parent_idx, Node::Internal(parent))
            }
            Some(Donor::Right) => {
                let mut right_node = right.expect("right donor");
                let right_idx = right_idx.expect("right donor index");
                let moved = right_node.cells.remove(0);
                debug!("leaf {} borrows key {} from right {}", page, moved.key, right_idx);
                parent.cells[slot].key = moved.key;
                leaf.cells.push(moved);
                txp.write_node(right_idx, Node::Leaf(right_node))?;
                txp.write_node(page, Node::Leaf(leaf))?;
                txp.write_node(parent_idx, Node::Internal(parent))
            }
            None => {
                // Merge, preferring the left sibling as survivor.
                if let (Some(mut survivor), Some(survivor_idx)) = (left, left_idx) {
                    debug!("leaf {} merges into left {}", page, survivor_idx);
                    survivor.cells.append(&mut leaf.cells);
                    survivor.next_leaf = leaf.next_leaf;
                    txp.write_node(survivor_idx, Node::Leaf(survivor))?;
                    self.remove_parent_entry(txp, parent_idx, parent, slot - 1, slot)?;
                    txp.add_free_page(page)?;
                } else if let (Some(mut victim), Some(victim_idx)) = (right, right_idx) {
                    debug!("leaf {} absorbs right {}", page, victim_idx);
                    leaf.cells.append(&mut victim.cells);
                    leaf.next_leaf = victim.next_leaf;
                    txp.write_node(page, Node::Leaf(leaf))?;
                    self.remove_parent_entry(txp, parent_idx, parent, slot, slot + 1)?;
                    txp.add_free_page(victim_idx)?;
                } else {
                    return Err(Error::invariant(
                        "btree.rebalance",
                        format!("leaf {} has no siblings under {}", page, parent_idx),
                    ));
                }
                self.rebalance(txp, parent_idx)
            }
        }
    }

    fn rebalance_internal(
        &self,
        txp: &mut TxPager<'_>,
        page: PageIndex,
        node: InternalNode,
    ) -> Result<()> {
        let parent_idx = node.parent;
        let mut parent = self.node(txp, parent_idx)?.into_internal()?;
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
        let left = left_idx
            .map(|i| self.node(txp, i).and_then(Node::into_internal))
            .transpose()?;
        let right = right_idx
            .map(|i| self.node(txp, i).and_then(Node::into_internal))
            .transpose()?;

        // Work on conceptual key/child arrays; set_slots rebuilds the cells.
        let mut keys: Vec<u64> = node.cells.iter().map(|c| c.key).collect();
        let mut children = node.child_slots();

        let floor = min_cells(self.internal_max());
        match pick_donor(
            left.as_ref().map(|n| n.cells.len()),
            right.as_ref().map(|n| n.cells.len()),
            floor,
        ) {
            Some(Donor::Left) => {
                let left_node = left.expect("left donor");
                let left_idx = left_idx.expect("left donor index");
                let mut lkeys: Vec<u64> = left_node.cells.iter().map(|c| c.key).collect();
                let mut lchildren = left_node.child_slots();

                // Rotate through the parent separator: the donor's last
                // child arrives under the old separator key.
                let moved_child = lchildren.pop().expect("donor child");
                let new_sep = lkeys.pop().expect("donor key");
                let old_sep = parent.cells[slot - 1].key;
                keys.insert(0, old_sep);
                children.insert(0, moved_child);
                parent.cells[slot - 1].key = new_sep;
                debug!(
                    "internal {} borrows child {} from left {}",
                    page, moved_child, left_idx
                );

                let mut rebuilt_left = left_node;
                rebuilt_left.set_slots(lkeys, lchildren)?;
                let mut rebuilt = node;
                rebuilt.set_slots(keys, children)?;
                txp.write_node(left_idx, Node::Internal(rebuilt_left))?;
                txp.write_node(page, Node::Internal(rebuilt))?;
                txp.write_node(parent_idx, Node::Internal(parent))?;
                self.reparent_children(txp, &[moved_child], page)
            }
            Some(Donor::Right) => {
                let right_node = right.expect("right donor");
                let right_idx = right_idx.expect("right donor index");
                let mut rkeys: Vec<u64> = right_node.cells.iter().map(|c| c.key).collect();
                let mut rchildren = right_node.child_slots();

                let moved_child = rchildren.remove(0);
                let new_sep = rkeys.remove(0);
                let old_sep = parent.cells[slot].key;
                keys.push(old_sep);
                children.push(moved_child);
                parent.cells[slot].key = new_sep;
                debug!(
                    "internal {} borrows child {} from right {}",
                    page, moved_child, right_idx
                );

                let mut rebuilt_right = right_node;
                rebuilt_right.set_slots(rkeys, rchildren)?;
                let mut rebuilt = node;
                rebuilt.set_slots(keys, children)?;
                txp.write_node(right_idx, Node::Internal(rebuilt_right))?;
                txp.write_node(page, Node::Internal(rebuilt))?;
                txp.write_node(parent_idx, Node::Internal(parent))?;
                self.reparent_children(txp, &[moved_child], page)
            }
            None => {
                if let (Some(survivor), Some(survivor_idx)) = (left, left_idx) {
                    debug!("internal {} merges into left {}", page, survivor_idx);
                    let sep = parent.cells[slot - 1].key;
                    let mut skeys: Vec<u64> = survivor.cells.iter().map(|c| c.key).collect();
                    let mut schildren = survivor.child_slots();
                    skeys.push(sep);
                    skeys.extend(keys);
                    let migrated = children.clone();
                    schildren.extend(children);

                    let mut rebuilt = survivor;
                    rebuilt.set_slots(skeys, schildren)?;
                    txp.write_node(survivor_idx, Node::Internal(rebuilt))?;
                    self.reparent_children(txp, &migrated, survivor_idx)?;
                    self.remove_parent_entry(txp, parent_idx, parent, slot - 1, slot)?;
                    txp.add_free_page(page)?;
                } else if let (Some(victim), Some(victim_idx)) = (right, right_idx) {
                    debug!("internal {} absorbs right {}", page, victim_idx);
                    let sep = parent.cells[slot].key;
                    keys.push(sep);
                    keys.extend(victim.cells.iter().map(|c| c.key));
                    let migrated = victim.child_slots();
                    children.extend(migrated.iter().copied());

                    let mut rebuilt = node;
                    rebuilt.set_slots(keys, children)?;
                    txp.write_node(page, Node::Internal(rebuilt))?;
                    self.reparent_children(txp, &migrated, page)?;
                    self.remove_parent_entry(txp, parent_idx, parent, slot, slot + 1)?;
                    txp.add_free_page(victim_idx)?;
                } else {
                    return Err(Error::invariant(
                        "btree.rebalance",
                        format!("internal {} has no siblings under {}", page, parent_idx),
                    ));
                }
                self.rebalance(txp, parent_idx)
            }
        }
    }

    /// Drop the separator at `key_pos` and the child at `child_pos` after a
    /// merge; the surviving child keeps covering the combined range.
    fn remove_parent_entry(
        &self,
        txp: &mut TxPager<'_>,
        parent_idx: PageIndex,
        parent: InternalNode,
        key_pos: usize,
        child_pos: usize,
    ) -> Result<()> {
        let mut keys: Vec<u64> = parent.cells.iter().map(|c| c.key).collect();
        let mut children = parent.child_slots();
        keys.remove(key_pos);
        children.remove(child_pos);
        let mut rebuilt = parent;
        rebuilt.set_slots(keys, children)?;
        txp.write_node(parent_idx, Node::Internal(rebuilt))
    }

    /// An internal root reduced to a single child: pull the child's contents
    /// into the root page and free the child.
    fn maybe_collapse_root(
        &self,
        txp: &mut TxPager<'_>,
        root: InternalNode,
    ) -> Result<()> {
        if !root.cells.is_empty() {
            return Ok(());
        }
        let child_idx = root.right_child.ok_or_else(|| {
            Error::corrupt("btree.collapse", "empty root without right child")
        })?;
        let mut child = self.node(txp, child_idx)?;
        child.set_is_root(true);
        child.set_parent(PageIndex(0));
        if let Node::Internal(ref n) = child {
            let grandchildren = n.child_slots();
            self.reparent_children(txp, &grandchildren, self.root())?;
        }
        debug!("root {} collapses child {}", self.root(), child_idx);
        txp.write_node(self.root(), child)?;
        txp.add_free_page(child_idx)
    }
}

enum Donor {
    Left,
    Right,
}

/// Choose a sibling that is strictly more than half full, preferring the one
/// with the greater surplus; ties go left.
fn pick_donor(left: Option<usize>, right: Option<usize>, floor: usize) -> Option<Donor> {
    let l = left.filter(|&n| n > floor);
    let r = right.filter(|&n| n > floor);
    match (l, r) {
        (Some(a), Some(b)) if b > a => Some(Donor::Right),
        (Some(_), _) => Some(Donor::Left),
        (None, Some(_)) => Some(Donor::Right),
        (None, None) => None,
    }
}
