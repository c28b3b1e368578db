//! Row values and the fixed-width row payload codec.
//!
//! A marshalled row is exactly `schema.row_size()` bytes. Null columns have
//! their bit set in the cell's null bitmask and a zeroed slot. Varchar values
//! longer than the inline limit are represented by a [`TextPointer`] into an
//! overflow chain; spilling and materializing happen in the table layer, so
//! by the time a row reaches this codec every value fits its slot.

use crate::codec;
use crate::config::MAX_INLINE_VARCHAR;
use crate::error::{Error, Result};
use crate::schema::{Column, ColumnKind, TableSchema};
use crate::types::PageIndex;

/// Indirect reference to an oversize varchar stored on overflow pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextPointer {
    pub first_page: PageIndex,
    pub length: u32,
}

/// Logical value of one column.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Varchar(String),
    /// Stored form of an oversize varchar; materialized back to `Varchar`
    /// when a scan walks the overflow chain.
    Text(TextPointer),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value can be stored in the given column.
    pub fn matches(&self, col: &Column) -> bool {
        match (self, col.kind) {
            (Value::Null, _) => col.nullable,
            (Value::Bool(_), ColumnKind::Bool) => true,
            (Value::Int4(_), ColumnKind::Int4) => true,
            (Value::Int8(_), ColumnKind::Int8) => true,
            (Value::Float4(_), ColumnKind::Float4) => true,
            (Value::Float8(_), ColumnKind::Float8) => true,
            (Value::Varchar(_), ColumnKind::Varchar) => true,
            (Value::Text(_), ColumnKind::Varchar) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int4(v) => write!(f, "{}", v),
            Value::Int8(v) => write!(f, "{}", v),
            Value::Float4(v) => write!(f, "{}", v),
            Value::Float8(v) => write!(f, "{}", v),
            Value::Varchar(s) => write!(f, "{}", s),
            Value::Text(p) => write!(f, "<text @{} len {}>", p.first_page, p.length),
        }
    }
}

/// A row: its tree key plus one value per schema column.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub id: u64,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(id: u64, values: Vec<Value>) -> Self {
        Self { id, values }
    }
}

/// Compute the null bitmask for a row; bit `i` marks column `i` null.
pub fn null_bitmask(values: &[Value]) -> u64 {
    let mut mask = 0u64;
    for (i, v) in values.iter().enumerate() {
        if v.is_null() {
            mask |= 1 << i;
        }
    }
    mask
}

/// Marshal row values into a payload of exactly `schema.row_size()` bytes.
pub fn marshal_values(schema: &TableSchema, values: &[Value]) -> Result<Vec<u8>> {
    if values.len() != schema.len() {
        return Err(Error::invariant(
            "row.marshal",
            format!(
                "schema has {} columns, row has {} values",
                schema.len(),
                values.len()
            ),
        ));
    }

    let mut buf = vec![0u8; schema.row_size()];
    let mut pos = 0;
    for (col, value) in schema.columns.iter().zip(values) {
        if !value.matches(col) {
            return Err(Error::invariant(
                "row.marshal",
                format!("value {} does not fit column '{}'", value, col.name),
            ));
        }
        let slot_end = pos + col.slot_size();
        match value {
            Value::Null => {}
            Value::Bool(b) => codec::write_u8(&mut buf, &mut pos, u8::from(*b)),
            Value::Int4(v) => codec::write_u32(&mut buf, &mut pos, *v as u32),
            Value::Int8(v) => codec::write_u64(&mut buf, &mut pos, *v as u64),
            Value::Float4(v) => codec::write_u32(&mut buf, &mut pos, v.to_bits()),
            Value::Float8(v) => codec::write_u64(&mut buf, &mut pos, v.to_bits()),
            Value::Varchar(s) => {
                if col.spills() {
                    if s.len() > MAX_INLINE_VARCHAR {
                        return Err(Error::invariant(
                            "row.marshal",
                            format!(
                                "varchar for column '{}' not spilled before marshal",
                                col.name
                            ),
                        ));
                    }
                    codec::write_u8(&mut buf, &mut pos, 0);
                    codec::write_padded(&mut buf, &mut pos, s.as_bytes(), MAX_INLINE_VARCHAR)?;
                } else {
                    codec::write_padded(&mut buf, &mut pos, s.as_bytes(), col.size)?;
                }
            }
            Value::Text(ptr) => {
                if !col.spills() {
                    return Err(Error::invariant(
                        "row.marshal",
                        format!("column '{}' cannot hold a text pointer", col.name),
                    ));
                }
                codec::write_u8(&mut buf, &mut pos, 1);
                codec::write_u32(&mut buf, &mut pos, ptr.first_page.0);
                codec::write_u32(&mut buf, &mut pos, ptr.length);
            }
        }
        pos = slot_end;
    }
    Ok(buf)
}

/// Unmarshal a payload back into values, consulting the null bitmask.
///
/// Oversize varchars come back as [`Value::Text`]; the caller materializes
/// them by walking the overflow chain.
pub fn unmarshal_values(schema: &TableSchema, bitmask: u64, payload: &[u8]) -> Result<Vec<Value>> {
    if payload.len() != schema.row_size() {
        return Err(Error::corrupt(
            "row.unmarshal",
            format!(
                "payload is {} bytes, schema expects {}",
                payload.len(),
                schema.row_size()
            ),
        ));
    }

    let mut values = Vec::with_capacity(schema.len());
    let mut pos = 0;
    for (i, col) in schema.columns.iter().enumerate() {
        let slot_end = pos + col.slot_size();
        if bitmask & (1 << i) != 0 {
            if !col.nullable {
                return Err(Error::corrupt(
                    "row.unmarshal",
                    format!("null bit set for non-nullable column '{}'", col.name),
                ));
            }
            values.push(Value::Null);
            pos = slot_end;
            continue;
        }

        let value = match col.kind {
            ColumnKind::Bool => Value::Bool(codec::read_bool(payload, &mut pos, "row.bool")?),
            ColumnKind::Int4 => {
                Value::Int4(codec::read_u32(payload, &mut pos, "row.int4")? as i32)
            }
            ColumnKind::Int8 => {
                Value::Int8(codec::read_u64(payload, &mut pos, "row.int8")? as i64)
            }
            ColumnKind::Float4 => Value::Float4(f32::from_bits(codec::read_u32(
                payload,
                &mut pos,
                "row.float4",
            )?)),
            ColumnKind::Float8 => Value::Float8(f64::from_bits(codec::read_u64(
                payload,
                &mut pos,
                "row.float8",
            )?)),
            ColumnKind::Varchar => {
                if col.spills() {
                    let marker = codec::read_u8(payload, &mut pos, "row.varchar")?;
                    match marker {
                        0 => Value::Varchar(codec::read_padded(
                            payload,
                            &mut pos,
                            MAX_INLINE_VARCHAR,
                            "row.varchar",
                        )?),
                        1 => {
                            let first_page =
                                codec::read_u32(payload, &mut pos, "row.text_pointer")?;
                            let length = codec::read_u32(payload, &mut pos, "row.text_pointer")?;
                            Value::Text(TextPointer {
                                first_page: PageIndex(first_page),
                                length,
                            })
                        }
                        b => {
                            return Err(Error::corrupt(
                                "row.varchar",
                                format!("invalid varchar marker byte {}", b),
                            ))
                        }
                    }
                } else {
                    Value::Varchar(codec::read_padded(
                        payload,
                        &mut pos,
                        col.size,
                        "row.varchar",
                    )?)
                }
            }
        };
        values.push(value);
        pos = slot_end;
    }
    Ok(values)
}
