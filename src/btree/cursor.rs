//! Cursor positioning over the row tree.

use crate::config::MAX_TREE_DEPTH;
use crate::error::{Error, Result};
use crate::node::{LeafCell, Node};
use crate::txn::TxPager;
use crate::types::PageIndex;

use super::RowTree;

/// A position inside the tree: a leaf page and a cell slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub page: PageIndex,
    pub cell: usize,
    pub end_of_table: bool,
}

impl RowTree {
    /// Position on the first cell of the leftmost leaf. On an empty tree the
    /// cursor starts exhausted.
    pub fn seek_first(&self, txp: &mut TxPager<'_>) -> Result<Cursor> {
        let mut current = self.root();
        for _ in 0..MAX_TREE_DEPTH {
            match self.node(txp, current)? {
                Node::Leaf(leaf) => {
                    return Ok(Cursor {
                        page: current,
                        cell: 0,
                        end_of_table: leaf.cells.is_empty(),
                    });
                }
                Node::Internal(node) => {
                    current = node.child_at(0)?;
                }
                other => {
                    return Err(Error::corrupt(
                        "btree.seek_first",
                        format!("unexpected {} node in row tree", other.kind_name()),
                    ))
                }
            }
        }
        Err(Error::corrupt(
            "btree.seek_first",
            "tree deeper than the depth bound",
        ))
    }

    /// Descend to the leaf that may hold `key`. Returns the cell slot of the
    /// key when found, otherwise its insertion position.
    pub fn seek(&self, txp: &mut TxPager<'_>, key: u64) -> Result<(Cursor, bool)> {
        let mut current = self.root();
        for _ in 0..MAX_TREE_DEPTH {
            match self.node(txp, current)? {
                Node::Leaf(leaf) => {
                    let (cell, found) = match leaf.find(key) {
                        Ok(i) => (i, true),
                        Err(i) => (i, false),
                    };
                    return Ok((
                        Cursor {
                            page: current,
                            cell,
                            end_of_table: cell >= leaf.cells.len() && leaf.next_leaf.is_zero(),
                        },
                        found,
                    ));
                }
                Node::Internal(node) => {
                    let slot = node.index_of_child(key);
                    current = node.child_at(slot)?;
                }
                other => {
                    return Err(Error::corrupt(
                        "btree.seek",
                        format!("unexpected {} node in row tree", other.kind_name()),
                    ))
                }
            }
        }
        Err(Error::corrupt("btree.seek", "tree deeper than the depth bound"))
    }

    /// Move to the next cell, following the leaf chain across pages.
    pub fn advance(&self, txp: &mut TxPager<'_>, cursor: &mut Cursor) -> Result<()> {
        if cursor.end_of_table {
            return Ok(());
        }
        let leaf = self.node(txp, cursor.page)?.into_leaf()?;
        cursor.cell += 1;
        if cursor.cell >= leaf.cells.len() {
            if leaf.next_leaf.is_zero() {
                cursor.end_of_table = true;
            } else {
                cursor.page = leaf.next_leaf;
                cursor.cell = 0;
            }
        }
        Ok(())
    }

    /// Read the cell under the cursor.
    pub fn cell_at(&self, txp: &mut TxPager<'_>, cursor: &Cursor) -> Result<LeafCell> {
        let leaf = self.node(txp, cursor.page)?.into_leaf()?;
        leaf.cells.get(cursor.cell).cloned().ok_or_else(|| {
            Error::invariant(
                "btree.cell_at",
                format!("cell {} out of range on page {}", cursor.cell, cursor.page),
            )
        })
    }
}
