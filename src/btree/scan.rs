//! Lazy cursor-driven scan over the row tree.
//!
//! The iterator yields raw leaf cells in ascending key order; decoding,
//! predicate filtering, and limit/offset accounting happen in the table
//! layer, which can stop consuming at any point. Each step checks the
//! transaction's context so a cancelled caller stops mid-scan.

use crate::error::Result;
use crate::node::LeafCell;
use crate::txn::TxPager;

use super::{Cursor, RowTree};

/// Iterator over every cell of a row tree in key order.
pub struct RowScan<'a, 't> {
    tree: &'a RowTree,
    txp: &'a mut TxPager<'t>,
    cursor: Cursor,
    failed: bool,
}

impl RowTree {
    /// Start a full scan at the first row.
    pub fn scan<'a, 't>(&'a self, txp: &'a mut TxPager<'t>) -> Result<RowScan<'a, 't>> {
        let cursor = self.seek_first(txp)?;
        Ok(RowScan {
            tree: self,
            txp,
            cursor,
            failed: false,
        })
    }
}

impl Iterator for RowScan<'_, '_> {
    type Item = Result<LeafCell>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor.end_of_table {
            return None;
        }
        if let Err(e) = self.txp.ctx().check() {
            self.failed = true;
            return Some(Err(e));
        }
        let cell = match self.tree.cell_at(self.txp, &self.cursor) {
            Ok(cell) => cell,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        if let Err(e) = self.tree.advance(self.txp, &mut self.cursor) {
            self.failed = true;
            return Some(Err(e));
        }
        Some(Ok(cell))
    }
}
