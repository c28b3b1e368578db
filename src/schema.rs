//! Table schema representation, validation, and row geometry.
//!
//! A schema fixes the byte width of every column slot, so each table has a
//! constant row size and leaf cells never change length in place.

use crate::config::{MAX_IDENT_LEN, MAX_INLINE_VARCHAR};
use crate::error::{Error, Result};

/// Column data types supported by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Bool,
    Int4,
    Int8,
    Float4,
    Float8,
    Varchar,
}

impl ColumnKind {
    /// SQL spelling used by the canonical DDL renderer.
    pub fn sql_name(self) -> &'static str {
        match self {
            ColumnKind::Bool => "BOOLEAN",
            ColumnKind::Int4 => "INT4",
            ColumnKind::Int8 => "INT8",
            ColumnKind::Float4 => "FLOAT4",
            ColumnKind::Float8 => "FLOAT8",
            ColumnKind::Varchar => "VARCHAR",
        }
    }

    /// Serialized width of a fixed-size value of this kind; varchar widths
    /// come from the column declaration instead.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            ColumnKind::Bool => Some(1),
            ColumnKind::Int4 | ColumnKind::Float4 => Some(4),
            ColumnKind::Int8 | ColumnKind::Float8 => Some(8),
            ColumnKind::Varchar => None,
        }
    }
}

/// Column definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    /// Declared size. Meaningful for varchar; equals the serialized width
    /// for the fixed kinds.
    pub size: usize,
    pub nullable: bool,
    pub primary_key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        let size = kind.fixed_size().unwrap_or(0);
        Self {
            name: name.into(),
            kind,
            size,
            nullable: false,
            primary_key: false,
        }
    }

    pub fn varchar(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Varchar,
            size,
            nullable: false,
            primary_key: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Whether values of this column can spill to overflow pages.
    pub fn spills(&self) -> bool {
        self.kind == ColumnKind::Varchar && self.size > MAX_INLINE_VARCHAR
    }

    /// Byte width of this column's slot inside a leaf cell payload.
    ///
    /// A spill-capable varchar slot is one marker byte plus room for either
    /// the inline value or the 8-byte text pointer.
    pub fn slot_size(&self) -> usize {
        match self.kind.fixed_size() {
            Some(n) => n,
            None => {
                if self.spills() {
                    1 + MAX_INLINE_VARCHAR
                } else {
                    self.size
                }
            }
        }
    }

    /// Serialized width of this column when used as an index key.
    pub fn key_size(&self) -> usize {
        self.kind.fixed_size().unwrap_or(self.size)
    }
}

/// Ordered, validated set of columns making up a table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    /// Construct a validated schema.
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Result<Self> {
        let name = name.into();
        validate_ident(&name, "table name")?;
        if columns.is_empty() {
            return Err(Error::bad_input("a table must have at least one column"));
        }
        // The null bitmask is a u64, one bit per column.
        if columns.len() > 64 {
            return Err(Error::bad_input(format!(
                "table '{}' declares {} columns, maximum is 64",
                name,
                columns.len()
            )));
        }

        let mut seen = std::collections::HashSet::new();
        let mut pk_count = 0usize;
        for col in &columns {
            validate_ident(&col.name, "column name")?;
            if !seen.insert(col.name.clone()) {
                return Err(Error::bad_input(format!(
                    "duplicate column name '{}'",
                    col.name
                )));
            }
            if col.kind == ColumnKind::Varchar && col.size == 0 {
                return Err(Error::bad_input(format!(
                    "varchar column '{}' must declare a size",
                    col.name
                )));
            }
            if col.primary_key {
                pk_count += 1;
                if col.nullable {
                    return Err(Error::bad_input(format!(
                        "primary key column '{}' cannot be nullable",
                        col.name
                    )));
                }
            }
        }
        if pk_count > 1 {
            return Err(Error::bad_input("at most one primary key column"));
        }

        Ok(Self { name, columns })
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Total payload bytes of one marshalled row.
    pub fn row_size(&self) -> usize {
        self.columns.iter().map(Column::slot_size).sum()
    }

    /// Position and definition of a column by name.
    pub fn column(&self, name: &str) -> Option<(usize, &Column)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
    }

    /// The primary key column, if declared.
    pub fn primary_key(&self) -> Option<(usize, &Column)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.primary_key)
    }

    /// Render the canonical `CREATE TABLE` text stored in the catalog.
    pub fn to_sql(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut s = match c.kind {
                    ColumnKind::Varchar => {
                        format!("{} VARCHAR({})", c.name, c.size)
                    }
                    kind => format!("{} {}", c.name, kind.sql_name()),
                };
                if c.primary_key {
                    s.push_str(" PRIMARY KEY");
                }
                if c.nullable {
                    s.push_str(" NULLABLE");
                }
                s
            })
            .collect();
        format!("CREATE TABLE {} ({})", self.name, cols.join(", "))
    }
}

fn validate_ident(name: &str, what: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IDENT_LEN {
        return Err(Error::bad_input(format!(
            "{} must be 1..={} characters",
            what, MAX_IDENT_LEN
        )));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(Error::bad_input(format!(
            "{} '{}' must start with a letter or underscore",
            what, name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(Error::bad_input(format!(
            "invalid characters in {} '{}'",
            what, name
        )));
    }
    Ok(())
}
