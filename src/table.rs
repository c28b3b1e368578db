//! Table-level statement execution: validation against the schema, row id
//! assignment, varchar spilling, and the binding between the row tree and
//! the optional primary-key index.

use std::sync::{Mutex, MutexGuard};

use log::debug;

use crate::btree::overflow;
use crate::btree::RowTree;
use crate::error::{Error, Result};
use crate::index::{IndexKey, IndexTree};
use crate::node::LeafCell;
use crate::row::{marshal_values, null_bitmask, unmarshal_values, Row, Value};
use crate::schema::{Column, ColumnKind, TableSchema};
use crate::statement::{
    condition_holds, CompareOp, Condition, SelectField, Statement, StatementKind,
    StatementResult,
};
use crate::txn::TxPager;
use crate::types::PageIndex;

/// A table's primary key: the column it covers and its index tree.
#[derive(Clone, Debug)]
pub struct PrimaryKey {
    pub column: usize,
    pub index: IndexTree,
}

/// A live table: schema, row tree, optional primary key.
#[derive(Debug)]
pub struct Table {
    schema: TableSchema,
    tree: RowTree,
    primary: Option<PrimaryKey>,
    /// Serializes mutating statements on this table so their scans cannot
    /// race a concurrent delete's rebalancing.
    write_lock: Mutex<()>,
}

/// A resolved condition: column slot, operator, coerced literal.
struct Filter {
    column: usize,
    op: CompareOp,
    value: Value,
}

impl Table {
    pub fn new(
        schema: TableSchema,
        root: PageIndex,
        primary_root: Option<PageIndex>,
    ) -> Result<Self> {
        let tree = RowTree::new(root, schema.row_size());
        let primary = match (schema.primary_key(), primary_root) {
            (Some((column, col)), Some(pk_root)) => Some(PrimaryKey {
                column,
                index: IndexTree::new(
                    pk_root,
                    crate::catalog::primary_key_name(&schema.name),
                    col.kind,
                    col.key_size(),
                ),
            }),
            (Some(_), None) => {
                return Err(Error::invariant(
                    "table.new",
                    format!("table '{}' declares a primary key but has no index root", schema.name),
                ))
            }
            (None, Some(_)) => {
                return Err(Error::invariant(
                    "table.new",
                    format!("table '{}' has an index root but no primary key", schema.name),
                ))
            }
            (None, None) => None,
        };
        Ok(Self {
            schema,
            tree,
            primary,
            write_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn tree(&self) -> &RowTree {
        &self.tree
    }

    pub fn primary(&self) -> Option<&PrimaryKey> {
        self.primary.as_ref()
    }

    /// Hold this across any statement that mutates the table.
    pub fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().expect("table write lock poisoned")
    }

    /// Execute one validated-on-the-way statement against this table.
    pub fn execute(&self, txp: &mut TxPager<'_>, stmt: &Statement) -> Result<StatementResult> {
        match stmt.kind {
            StatementKind::Insert => self.insert(txp, stmt),
            StatementKind::Select => self.select(txp, stmt),
            StatementKind::Update => self.update(txp, stmt),
            StatementKind::Delete => self.delete(txp, stmt),
            other => Err(Error::invariant(
                "table.execute",
                format!("statement kind {:?} does not target a table", other),
            )),
        }
    }

    // ---- INSERT ----------------------------------------------------------

    fn insert(&self, txp: &mut TxPager<'_>, stmt: &Statement) -> Result<StatementResult> {
        let rows = self.resolve_insert_rows(stmt)?;
        let inserted = self.insert_rows(txp, rows)?;
        Ok(StatementResult::affected(inserted))
    }

    /// Insert fully-typed rows, assigning ids past the current maximum.
    pub fn insert_rows(&self, txp: &mut TxPager<'_>, rows: Vec<Vec<Value>>) -> Result<u64> {
        let mut next_id = self.tree.max_key(txp)?.map_or(1, |k| k + 1);
        let count = rows.len() as u64;
        for mut values in rows {
            let row_id = next_id;
            next_id += 1;

            if let Some(pk) = &self.primary {
                let key = IndexKey::from_value(&values[pk.column], pk.index.kind())?;
                pk.index.insert(txp, key, row_id)?;
            }

            self.spill_oversize(txp, &mut values)?;
            let cell = LeafCell {
                key: row_id,
                null_bitmask: null_bitmask(&values),
                payload: marshal_values(&self.schema, &values)?,
            };
            self.tree.insert(txp, cell)?;
        }
        debug!("inserted {} rows into '{}'", count, self.name());
        Ok(count)
    }

    /// Reorder and coerce statement values into schema order.
    fn resolve_insert_rows(&self, stmt: &Statement) -> Result<Vec<Vec<Value>>> {
        let mut out = Vec::with_capacity(stmt.inserts.len());
        if stmt.inserts.is_empty() {
            return Err(Error::bad_input("INSERT carries no rows"));
        }
        for given in &stmt.inserts {
            let values = if stmt.insert_columns.is_empty() {
                if given.len() != self.schema.len() {
                    return Err(Error::bad_input(format!(
                        "table '{}' has {} columns, INSERT supplies {}",
                        self.name(),
                        self.schema.len(),
                        given.len()
                    )));
                }
                given.clone()
            } else {
                if given.len() != stmt.insert_columns.len() {
                    return Err(Error::bad_input(format!(
                        "INSERT names {} columns but supplies {} values",
                        stmt.insert_columns.len(),
                        given.len()
                    )));
                }
                let mut values = vec![Value::Null; self.schema.len()];
                for (name, value) in stmt.insert_columns.iter().zip(given) {
                    let (pos, _) = self.column(name)?;
                    values[pos] = value.clone();
                }
                values
            };
            let coerced: Vec<Value> = values
                .iter()
                .zip(&self.schema.columns)
                .map(|(v, col)| coerce_value(v, col))
                .collect::<Result<_>>()?;
            out.push(coerced);
        }
        Ok(out)
    }

    // ---- SELECT ----------------------------------------------------------

    fn select(&self, txp: &mut TxPager<'_>, stmt: &Statement) -> Result<StatementResult> {
        let filters = self.build_filters(&stmt.conditions)?;
        let projection = self.build_projection(&stmt.fields)?;

        // A lone equality on the primary key becomes an index point seek.
        let mut rows = match self.point_lookup(txp, &filters)? {
            PointLookup::Hit(row_id) => match self.read_row(txp, row_id)? {
                Some(row) => vec![row],
                None => Vec::new(),
            },
            PointLookup::Miss => Vec::new(),
            PointLookup::NotApplicable => {
                self.scan_matching(txp, &filters, stmt.limit, stmt.offset)?
            }
        };

        match projection {
            Projection::CountAll => {
                let count = rows.len() as i64;
                Ok(StatementResult {
                    columns: vec!["count".to_string()],
                    rows: crate::statement::Rows::new(vec![Row::new(0, vec![Value::Int8(count)])]),
                    rows_affected: 0,
                })
            }
            Projection::Columns(cols) => {
                for row in &mut rows {
                    self.materialize(txp, &mut row.values)?;
                    row.values = cols.iter().map(|&i| row.values[i].clone()).collect();
                }
                Ok(StatementResult {
                    columns: cols
                        .iter()
                        .map(|&i| self.schema.columns[i].name.clone())
                        .collect(),
                    rows: crate::statement::Rows::new(rows),
                    rows_affected: 0,
                })
            }
        }
    }

    /// Cursor-driven scan applying the predicate, offset, and limit; stops
    /// as soon as the limit is satisfied.
    fn scan_matching(
        &self,
        txp: &mut TxPager<'_>,
        filters: &[Filter],
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        let mut to_skip = offset.max(0) as u64;
        let mut cursor = self.tree.seek_first(txp)?;
        while !cursor.end_of_table {
            txp.ctx().check()?;
            let cell = self.tree.cell_at(txp, &cursor)?;
            let values = unmarshal_values(&self.schema, cell.null_bitmask, &cell.payload)?;
            if self.row_matches(txp, &values, filters)? {
                if to_skip > 0 {
                    to_skip -= 1;
                } else {
                    rows.push(Row::new(cell.key, values));
                    if limit > 0 && rows.len() as i64 >= limit {
                        break;
                    }
                }
            }
            self.tree.advance(txp, &mut cursor)?;
        }
        Ok(rows)
    }

    fn point_lookup(&self, txp: &mut TxPager<'_>, filters: &[Filter]) -> Result<PointLookup> {
        let (pk, filter) = match (&self.primary, filters) {
            (Some(pk), [f]) if f.op == CompareOp::Eq && f.column == pk.column => (pk, f),
            _ => return Ok(PointLookup::NotApplicable),
        };
        let key = IndexKey::from_value(&filter.value, pk.index.kind())?;
        match pk.index.find(txp, &key) {
            Ok(row_id) => Ok(PointLookup::Hit(row_id)),
            Err(Error::NotFound { .. }) => Ok(PointLookup::Miss),
            Err(e) => Err(e),
        }
    }

    /// Fetch one row by id; `None` when the id is absent.
    fn read_row(&self, txp: &mut TxPager<'_>, row_id: u64) -> Result<Option<Row>> {
        let (cursor, found) = self.tree.seek(txp, row_id)?;
        if !found {
            return Ok(None);
        }
        let cell = self.tree.cell_at(txp, &cursor)?;
        let values = unmarshal_values(&self.schema, cell.null_bitmask, &cell.payload)?;
        Ok(Some(Row::new(cell.key, values)))
    }

    // ---- UPDATE ----------------------------------------------------------

    fn update(&self, txp: &mut TxPager<'_>, stmt: &Statement) -> Result<StatementResult> {
        let filters = self.build_filters(&stmt.conditions)?;
        let mut assignments = Vec::with_capacity(stmt.updates.len());
        for a in &stmt.updates {
            let (pos, col) = self.column(&a.column)?;
            assignments.push((pos, coerce_value(&a.value, col)?));
        }

        // Phase one: materialize the matching set before mutating anything.
        let targets = self.scan_matching(txp, &filters, 0, 0)?;

        for row in &targets {
            let mut values = row.values.clone();
            for (pos, value) in &assignments {
                let col = &self.schema.columns[*pos];
                let old = std::mem::replace(&mut values[*pos], value.clone());

                if col.primary_key {
                    let pk = self.primary.as_ref().expect("primary key column");
                    let mut old_key_value = old.clone();
                    self.materialize_one(txp, &mut old_key_value)?;
                    let old_key = IndexKey::from_value(&old_key_value, pk.index.kind())?;
                    let new_key = IndexKey::from_value(value, pk.index.kind())?;
                    if old_key != new_key {
                        pk.index.delete(txp, &old_key)?;
                        pk.index.insert(txp, new_key, row.id)?;
                    }
                }
                // A replaced spilled value releases its chain.
                if let Value::Text(ptr) = old {
                    overflow::free_chain(txp, ptr.first_page)?;
                }
            }
            self.spill_oversize(txp, &mut values)?;
            let cell = LeafCell {
                key: row.id,
                null_bitmask: null_bitmask(&values),
                payload: marshal_values(&self.schema, &values)?,
            };
            self.tree.update(txp, cell)?;
        }
        debug!("updated {} rows in '{}'", targets.len(), self.name());
        Ok(StatementResult::affected(targets.len() as u64))
    }

    // ---- DELETE ----------------------------------------------------------

    fn delete(&self, txp: &mut TxPager<'_>, stmt: &Statement) -> Result<StatementResult> {
        let filters = self.build_filters(&stmt.conditions)?;

        // Phase one: collect the matching keys so rebalancing cannot skip
        // rows out from under the scan.
        let targets = self.scan_matching(txp, &filters, 0, 0)?;

        // Phase two: remove each row, unlink the primary key, then release
        // the overflow chains (the key may live on one of them).
        for row in &targets {
            let cell = self.tree.delete(txp, row.id)?;
            let values = unmarshal_values(&self.schema, cell.null_bitmask, &cell.payload)?;
            if let Some(pk) = &self.primary {
                let mut key_value = values[pk.column].clone();
                self.materialize_one(txp, &mut key_value)?;
                let key = IndexKey::from_value(&key_value, pk.index.kind())?;
                pk.index.delete(txp, &key)?;
            }
            for value in &values {
                if let Value::Text(ptr) = value {
                    overflow::free_chain(txp, ptr.first_page)?;
                }
            }
        }
        debug!("deleted {} rows from '{}'", targets.len(), self.name());
        Ok(StatementResult::affected(targets.len() as u64))
    }

    // ---- shared helpers --------------------------------------------------

    /// Every page owned by this table: row tree, overflow chains, and the
    /// primary-key index. Used when the table is dropped.
    pub fn collect_all_pages(&self, txp: &mut TxPager<'_>) -> Result<Vec<PageIndex>> {
        let mut pages = Vec::new();

        let mut cursor = self.tree.seek_first(txp)?;
        while !cursor.end_of_table {
            let cell = self.tree.cell_at(txp, &cursor)?;
            let values = unmarshal_values(&self.schema, cell.null_bitmask, &cell.payload)?;
            for value in values {
                if let Value::Text(ptr) = value {
                    let mut current = ptr.first_page;
                    while !current.is_zero() {
                        pages.push(current);
                        current = txp
                            .read_node(current, crate::node::NodeSpec::Overflow)?
                            .into_overflow()?
                            .next;
                    }
                }
            }
            self.tree.advance(txp, &mut cursor)?;
        }

        pages.extend(self.tree.collect_pages(txp)?);
        if let Some(pk) = &self.primary {
            pages.extend(pk.index.collect_pages(txp)?);
        }
        Ok(pages)
    }

    fn column(&self, name: &str) -> Result<(usize, &Column)> {
        self.schema.column(name).ok_or_else(|| {
            Error::bad_input(format!(
                "table '{}' has no column '{}'",
                self.name(),
                name
            ))
        })
    }

    fn build_filters(&self, conditions: &[Condition]) -> Result<Vec<Filter>> {
        conditions
            .iter()
            .map(|c| {
                let (pos, col) = self.column(&c.column)?;
                let value = match c.op {
                    CompareOp::IsNull | CompareOp::IsNotNull => Value::Null,
                    _ => coerce_value(&c.value, col)?,
                };
                Ok(Filter {
                    column: pos,
                    op: c.op,
                    value,
                })
            })
            .collect()
    }

    fn build_projection(&self, fields: &[SelectField]) -> Result<Projection> {
        if fields.iter().any(|f| matches!(f, SelectField::CountAll)) {
            if fields.len() > 1 {
                return Err(Error::bad_input(
                    "COUNT(*) cannot be combined with other select fields",
                ));
            }
            return Ok(Projection::CountAll);
        }
        let mut cols = Vec::new();
        for field in fields {
            match field {
                SelectField::All => cols.extend(0..self.schema.len()),
                SelectField::Column(name) => cols.push(self.column(name)?.0),
                SelectField::CountAll => unreachable!(),
            }
        }
        if cols.is_empty() {
            return Err(Error::bad_input("empty select list"));
        }
        Ok(Projection::Columns(cols))
    }

    /// Apply the conjunction. Spilled values are materialized into a
    /// scratch copy so the stored row keeps its text pointers; update and
    /// delete rely on those pointers to release the old chains.
    fn row_matches(
        &self,
        txp: &mut TxPager<'_>,
        values: &[Value],
        filters: &[Filter],
    ) -> Result<bool> {
        for f in filters {
            let scratch;
            let column_value = match &values[f.column] {
                Value::Text(ptr) => {
                    scratch = Value::Varchar(overflow::read_chain(txp, *ptr)?);
                    &scratch
                }
                other => other,
            };
            if !condition_holds(f.op, column_value, &f.value) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Replace every text pointer in the row with the chained-out string.
    fn materialize(&self, txp: &mut TxPager<'_>, values: &mut [Value]) -> Result<()> {
        for value in values.iter_mut() {
            self.materialize_one(txp, value)?;
        }
        Ok(())
    }

    fn materialize_one(&self, txp: &mut TxPager<'_>, value: &mut Value) -> Result<()> {
        if let Value::Text(ptr) = *value {
            *value = Value::Varchar(overflow::read_chain(txp, ptr)?);
        }
        Ok(())
    }

    /// Move oversize varchars onto overflow chains before marshalling.
    fn spill_oversize(&self, txp: &mut TxPager<'_>, values: &mut [Value]) -> Result<()> {
        for value in values.iter_mut() {
            if let Value::Varchar(s) = value {
                if s.len() > crate::config::MAX_INLINE_VARCHAR {
                    let ptr = overflow::write_chain(txp, s.as_bytes())?;
                    *value = Value::Text(ptr);
                }
            }
        }
        Ok(())
    }
}

/// What a select statement projects.
enum Projection {
    CountAll,
    Columns(Vec<usize>),
}

/// Outcome of trying to satisfy a WHERE clause with the primary key.
enum PointLookup {
    Hit(u64),
    Miss,
    NotApplicable,
}

/// Fit a statement literal to a column, or explain why it cannot.
pub fn coerce_value(value: &Value, col: &Column) -> Result<Value> {
    let mismatch = || {
        Error::bad_input(format!(
            "value {} does not fit column '{}' ({:?})",
            value, col.name, col.kind
        ))
    };
    match (value, col.kind) {
        (Value::Null, _) => {
            if col.nullable {
                Ok(Value::Null)
            } else {
                Err(Error::bad_input(format!(
                    "column '{}' is not nullable",
                    col.name
                )))
            }
        }
        (Value::Bool(b), ColumnKind::Bool) => Ok(Value::Bool(*b)),
        (Value::Int8(v), ColumnKind::Int8) => Ok(Value::Int8(*v)),
        (Value::Int8(v), ColumnKind::Int4) => i32::try_from(*v)
            .map(Value::Int4)
            .map_err(|_| mismatch()),
        (Value::Int4(v), ColumnKind::Int4) => Ok(Value::Int4(*v)),
        (Value::Int8(v), ColumnKind::Float8) => Ok(Value::Float8(*v as f64)),
        (Value::Int8(v), ColumnKind::Float4) => Ok(Value::Float4(*v as f32)),
        (Value::Float8(v), ColumnKind::Float8) => Ok(Value::Float8(*v)),
        (Value::Float8(v), ColumnKind::Float4) => Ok(Value::Float4(*v as f32)),
        (Value::Float4(v), ColumnKind::Float4) => Ok(Value::Float4(*v)),
        (Value::Varchar(s), ColumnKind::Varchar) => {
            if s.len() > col.size {
                Err(Error::bad_input(format!(
                    "string of {} bytes exceeds varchar({}) column '{}'",
                    s.len(),
                    col.size,
                    col.name
                )))
            } else {
                Ok(Value::Varchar(s.clone()))
            }
        }
        _ => Err(mismatch()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varchar_col(size: usize) -> Column {
        Column::varchar("v", size)
    }

    #[test]
    fn coerce_narrows_integer_literals() {
        let col = Column::new("n", ColumnKind::Int4);
        assert_eq!(coerce_value(&Value::Int8(12), &col).unwrap(), Value::Int4(12));
        assert!(coerce_value(&Value::Int8(i64::MAX), &col).is_err());
    }

    #[test]
    fn coerce_widens_numeric_literals_to_floats() {
        let col = Column::new("f", ColumnKind::Float8);
        assert_eq!(
            coerce_value(&Value::Int8(2), &col).unwrap(),
            Value::Float8(2.0)
        );
        let col4 = Column::new("f", ColumnKind::Float4);
        assert_eq!(
            coerce_value(&Value::Float8(1.5), &col4).unwrap(),
            Value::Float4(1.5)
        );
    }

    #[test]
    fn coerce_checks_varchar_capacity_and_nullability() {
        assert!(coerce_value(&Value::Varchar("abcdef".into()), &varchar_col(4)).is_err());
        assert!(coerce_value(&Value::Varchar("abcd".into()), &varchar_col(4)).is_ok());

        let col = Column::new("n", ColumnKind::Int8);
        assert!(coerce_value(&Value::Null, &col).is_err());
        assert!(coerce_value(&Value::Null, &col.clone().nullable()).is_ok());
    }

    #[test]
    fn coerce_rejects_kind_mismatches() {
        let col = Column::new("n", ColumnKind::Int8);
        assert!(coerce_value(&Value::Varchar("1".into()), &col).is_err());
        assert!(coerce_value(&Value::Float8(1.0), &col).is_err());
        assert!(coerce_value(&Value::Bool(true), &varchar_col(4)).is_err());
    }
}
