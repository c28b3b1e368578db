//! Statement value objects exchanged with the SQL front end, and the result
//! surface handed back to callers.

use std::cmp::Ordering;

use crate::row::{Row, Value};
use crate::schema::Column;

/// What a statement asks the engine to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatementKind {
    CreateTable,
    DropTable,
    Insert,
    Select,
    Update,
    Delete,
    Begin,
    Commit,
    Rollback,
}

/// One item of a select list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectField {
    All,
    CountAll,
    Column(String),
}

/// Comparison operators usable in a WHERE conjunction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    IsNull,
    IsNotNull,
}

/// One conjunct of a WHERE clause. `value` is unused for the null checks.
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    pub column: String,
    pub op: CompareOp,
    pub value: Value,
}

/// One SET item of an UPDATE.
#[derive(Clone, Debug, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: Value,
}

/// A parsed statement. Fields irrelevant to the kind stay empty.
/// `limit`/`offset` values ≤ 0 mean "unlimited"/"from the start".
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub table_name: String,
    pub columns: Vec<Column>,
    pub fields: Vec<SelectField>,
    pub insert_columns: Vec<String>,
    pub inserts: Vec<Vec<Value>>,
    pub updates: Vec<Assignment>,
    pub conditions: Vec<Condition>,
    pub limit: i64,
    pub offset: i64,
}

impl Statement {
    pub fn new(kind: StatementKind) -> Self {
        Self {
            kind,
            table_name: String::new(),
            columns: Vec::new(),
            fields: Vec::new(),
            insert_columns: Vec::new(),
            inserts: Vec::new(),
            updates: Vec::new(),
            conditions: Vec::new(),
            limit: 0,
            offset: 0,
        }
    }
}

/// Compare two values of the same kind; `None` when either is NULL or the
/// kinds differ. Floats use IEEE total order, matching the index trees.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Int4(x), Value::Int4(y)) => Some(x.cmp(y)),
        (Value::Int8(x), Value::Int8(y)) => Some(x.cmp(y)),
        (Value::Float4(x), Value::Float4(y)) => Some(x.total_cmp(y)),
        (Value::Float8(x), Value::Float8(y)) => Some(x.total_cmp(y)),
        (Value::Varchar(x), Value::Varchar(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Evaluate one condition against a column value. NULLs satisfy only the
/// explicit null checks.
pub fn condition_holds(op: CompareOp, column_value: &Value, literal: &Value) -> bool {
    match op {
        CompareOp::IsNull => column_value.is_null(),
        CompareOp::IsNotNull => !column_value.is_null(),
        _ => match compare_values(column_value, literal) {
            None => false,
            Some(ord) => match op {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::Ne => ord != Ordering::Equal,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
                CompareOp::IsNull | CompareOp::IsNotNull => unreachable!(),
            },
        },
    }
}

/// Rows produced by one statement, already decoded and materialized.
///
/// Exhaustion is the iterator's `None`; there are no further sentinels.
#[derive(Debug)]
pub struct Rows {
    rows: std::vec::IntoIter<Row>,
}

impl Rows {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Default for Rows {
    fn default() -> Self {
        Self::empty()
    }
}

impl Iterator for Rows {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows.next()
    }
}

/// The outcome of executing one statement.
#[derive(Debug)]
pub struct StatementResult {
    pub columns: Vec<String>,
    pub rows: Rows,
    pub rows_affected: u64,
}

impl StatementResult {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Rows::empty(),
            rows_affected: 0,
        }
    }

    pub fn affected(n: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Rows::empty(),
            rows_affected: n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparisons_respect_kind_boundaries() {
        assert_eq!(
            compare_values(&Value::Int8(1), &Value::Int8(2)),
            Some(Ordering::Less)
        );
        assert_eq!(compare_values(&Value::Int8(1), &Value::Int4(1)), None);
        assert_eq!(compare_values(&Value::Null, &Value::Int8(1)), None);
    }

    #[test]
    fn null_checks_are_the_only_null_matches() {
        assert!(condition_holds(CompareOp::IsNull, &Value::Null, &Value::Null));
        assert!(!condition_holds(CompareOp::IsNull, &Value::Int8(1), &Value::Null));
        assert!(condition_holds(CompareOp::IsNotNull, &Value::Int8(1), &Value::Null));
        // NULL never satisfies an ordinary comparison, not even inequality.
        assert!(!condition_holds(CompareOp::Eq, &Value::Null, &Value::Null));
        assert!(!condition_holds(CompareOp::Ne, &Value::Null, &Value::Int8(1)));
    }

    #[test]
    fn operators_cover_the_orderings() {
        let two = Value::Int8(2);
        let three = Value::Int8(3);
        assert!(condition_holds(CompareOp::Lt, &two, &three));
        assert!(condition_holds(CompareOp::Le, &two, &two));
        assert!(condition_holds(CompareOp::Gt, &three, &two));
        assert!(condition_holds(CompareOp::Ge, &three, &three));
        assert!(condition_holds(CompareOp::Ne, &two, &three));
        assert!(!condition_holds(CompareOp::Eq, &two, &three));
    }

    #[test]
    fn rows_iterate_then_exhaust() {
        let mut rows = Rows::new(vec![Row::new(1, vec![Value::Int8(10)])]);
        assert_eq!(rows.next().unwrap().id, 1);
        assert!(rows.next().is_none());
        assert!(rows.next().is_none());
    }
}
