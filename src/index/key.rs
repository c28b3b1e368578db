//! Typed keys for unique indexes.
//!
//! The six key kinds are dispatched by the runtime [`ColumnKind`] tag of the
//! indexed column, so one tree implementation serves them all. Comparison is
//! a strict total order per kind: IEEE total order for floats, lexicographic
//! byte order for strings.

use std::cmp::Ordering;

use crate::codec;
use crate::error::{Error, Result};
use crate::row::Value;
use crate::schema::ColumnKind;

/// A typed index key.
#[derive(Clone, Debug, PartialEq)]
pub enum IndexKey {
    Bool(bool),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Varchar(String),
}

impl IndexKey {
    /// The column kind this key belongs to.
    pub fn kind(&self) -> ColumnKind {
        match self {
            IndexKey::Bool(_) => ColumnKind::Bool,
            IndexKey::Int4(_) => ColumnKind::Int4,
            IndexKey::Int8(_) => ColumnKind::Int8,
            IndexKey::Float4(_) => ColumnKind::Float4,
            IndexKey::Float8(_) => ColumnKind::Float8,
            IndexKey::Varchar(_) => ColumnKind::Varchar,
        }
    }

    /// Build a key from a row value, enforcing the indexed column's kind.
    pub fn from_value(value: &Value, kind: ColumnKind) -> Result<Self> {
        let key = match (value, kind) {
            (Value::Bool(b), ColumnKind::Bool) => IndexKey::Bool(*b),
            (Value::Int4(v), ColumnKind::Int4) => IndexKey::Int4(*v),
            (Value::Int8(v), ColumnKind::Int8) => IndexKey::Int8(*v),
            (Value::Float4(v), ColumnKind::Float4) => IndexKey::Float4(*v),
            (Value::Float8(v), ColumnKind::Float8) => IndexKey::Float8(*v),
            (Value::Varchar(s), ColumnKind::Varchar) => IndexKey::Varchar(s.clone()),
            (Value::Null, _) => {
                return Err(Error::bad_input("NULL cannot be used as an index key"))
            }
            (v, k) => {
                return Err(Error::bad_input(format!(
                    "value {} does not match indexed column kind {:?}",
                    v, k
                )))
            }
        };
        Ok(key)
    }

    /// Convert back into a row value.
    pub fn to_value(&self) -> Value {
        match self {
            IndexKey::Bool(b) => Value::Bool(*b),
            IndexKey::Int4(v) => Value::Int4(*v),
            IndexKey::Int8(v) => Value::Int8(*v),
            IndexKey::Float4(v) => Value::Float4(*v),
            IndexKey::Float8(v) => Value::Float8(*v),
            IndexKey::Varchar(s) => Value::Varchar(s.clone()),
        }
    }

    /// Serialize into a fixed-width slot. Varchar keys use `key_size`.
    pub fn marshal(&self, buf: &mut [u8], pos: &mut usize, key_size: usize) -> Result<()> {
        match self {
            IndexKey::Bool(b) => codec::write_u8(buf, pos, u8::from(*b)),
            IndexKey::Int4(v) => codec::write_u32(buf, pos, *v as u32),
            IndexKey::Int8(v) => codec::write_u64(buf, pos, *v as u64),
            IndexKey::Float4(v) => codec::write_u32(buf, pos, v.to_bits()),
            IndexKey::Float8(v) => codec::write_u64(buf, pos, v.to_bits()),
            IndexKey::Varchar(s) => codec::write_padded(buf, pos, s.as_bytes(), key_size)?,
        }
        Ok(())
    }

    /// Decode a key of the given kind from a fixed-width slot.
    pub fn unmarshal(
        buf: &[u8],
        pos: &mut usize,
        kind: ColumnKind,
        key_size: usize,
    ) -> Result<Self> {
        let key = match kind {
            ColumnKind::Bool => IndexKey::Bool(codec::read_bool(buf, pos, "index.key")?),
            ColumnKind::Int4 => IndexKey::Int4(codec::read_u32(buf, pos, "index.key")? as i32),
            ColumnKind::Int8 => IndexKey::Int8(codec::read_u64(buf, pos, "index.key")? as i64),
            ColumnKind::Float4 => {
                IndexKey::Float4(f32::from_bits(codec::read_u32(buf, pos, "index.key")?))
            }
            ColumnKind::Float8 => {
                IndexKey::Float8(f64::from_bits(codec::read_u64(buf, pos, "index.key")?))
            }
            ColumnKind::Varchar => {
                IndexKey::Varchar(codec::read_padded(buf, pos, key_size, "index.key")?)
            }
        };
        Ok(key)
    }
}

impl Eq for IndexKey {}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexKey::Bool(a), IndexKey::Bool(b)) => a.cmp(b),
            (IndexKey::Int4(a), IndexKey::Int4(b)) => a.cmp(b),
            (IndexKey::Int8(a), IndexKey::Int8(b)) => a.cmp(b),
            (IndexKey::Float4(a), IndexKey::Float4(b)) => a.total_cmp(b),
            (IndexKey::Float8(a), IndexKey::Float8(b)) => a.total_cmp(b),
            (IndexKey::Varchar(a), IndexKey::Varchar(b)) => a.cmp(b),
            // Keys inside one tree always share a kind; a mismatch can only
            // come from a programming error, so order by tag deterministically.
            (a, b) => discriminant_rank(a).cmp(&discriminant_rank(b)),
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn discriminant_rank(key: &IndexKey) -> u8 {
    match key {
        IndexKey::Bool(_) => 0,
        IndexKey::Int4(_) => 1,
        IndexKey::Int8(_) => 2,
        IndexKey::Float4(_) => 3,
        IndexKey::Float8(_) => 4,
        IndexKey::Varchar(_) => 5,
    }
}
