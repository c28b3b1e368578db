//! The catalog: a self-describing meta-table listing every table and
//! primary-key index, rooted at page 0.
//!
//! Rows are `(type, name, root_page, sql)`. Table rows carry the canonical
//! DDL, which the SQL front end re-parses on open to rebuild schemas;
//! primary-key rows carry the index root, with the owning table encoded in
//! the index name.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};

use crate::btree::overflow;
use crate::config::{META_SQL_SIZE, META_TABLE_NAME};
use crate::ctx::Ctx;
use crate::error::{Error, Result};
use crate::node::{LeafNode, Node};
use crate::pager::Pager;
use crate::parser::Parser;
use crate::row::Value;
use crate::schema::{Column, ColumnKind, TableSchema};
use crate::statement::{CompareOp, Condition, Statement, StatementKind};
use crate::table::Table;
use crate::txn::{run_in_transaction, TransactionManager, TxPager};
use crate::types::PageIndex;

/// `type` column value for table records.
pub const SCHEMA_TABLE: i32 = 1;
/// `type` column value for primary-key index records.
pub const SCHEMA_PRIMARY_KEY: i32 = 2;

/// Schema of the meta-table itself.
pub fn meta_schema() -> TableSchema {
    TableSchema::new(
        META_TABLE_NAME,
        vec![
            Column::new("type", ColumnKind::Int4),
            Column::varchar("name", 96),
            Column::new("root_page", ColumnKind::Int4),
            Column::varchar("sql", META_SQL_SIZE),
        ],
    )
    .expect("the meta schema is well-formed")
}

/// Name of the primary-key index owned by `table`.
pub fn primary_key_name(table: &str) -> String {
    format!("primary_key_{}", table)
}

/// Inverse of [`primary_key_name`].
pub fn table_name_from_primary_key(index_name: &str) -> Option<&str> {
    index_name.strip_prefix("primary_key_")
}

/// The loaded catalog: the meta-table plus every user table by name.
#[derive(Debug)]
pub struct Catalog {
    meta: Arc<Table>,
    tables: HashMap<String, Arc<Table>>,
}

impl Catalog {
    /// Bootstrap an empty file or load an existing one.
    pub fn open(
        store: &Pager,
        mgr: &TransactionManager,
        ctx: &Ctx,
        parser: &Parser,
    ) -> Result<Self> {
        let meta = Arc::new(Table::new(meta_schema(), PageIndex(0), None)?);
        if store.total_pages() == 0 {
            run_in_transaction(store, mgr, ctx, |txp| bootstrap(txp, &meta))?;
            info!("created new database at {}", store.path().display());
            return Ok(Self {
                meta,
                tables: HashMap::new(),
            });
        }

        let records = run_in_transaction(store, mgr, ctx, |txp| read_records(txp, &meta))?;
        let mut pk_roots: HashMap<String, PageIndex> = HashMap::new();
        for rec in records.iter().filter(|r| r.kind == SCHEMA_PRIMARY_KEY) {
            let table = table_name_from_primary_key(&rec.name).ok_or_else(|| {
                Error::corrupt(
                    "catalog.load",
                    format!("index record '{}' does not name its table", rec.name),
                )
            })?;
            pk_roots.insert(table.to_string(), rec.root);
        }

        let mut tables = HashMap::new();
        for rec in records.iter().filter(|r| r.kind == SCHEMA_TABLE) {
            if rec.name == META_TABLE_NAME {
                continue;
            }
            let schema = schema_from_sql(parser, &rec.sql)?;
            if schema.name != rec.name {
                return Err(Error::corrupt(
                    "catalog.load",
                    format!(
                        "record named '{}' carries DDL for '{}'",
                        rec.name, schema.name
                    ),
                ));
            }
            let pk_root = pk_roots.remove(&rec.name);
            let table = Table::new(schema, rec.root, pk_root)?;
            tables.insert(rec.name.clone(), Arc::new(table));
        }
        if let Some((orphan, _)) = pk_roots.into_iter().next() {
            return Err(Error::corrupt(
                "catalog.load",
                format!("primary-key record for missing table '{}'", orphan),
            ));
        }
        info!(
            "opened database at {} with {} tables",
            store.path().display(),
            tables.len()
        );
        Ok(Self { meta, tables })
    }

    pub fn meta(&self) -> &Arc<Table> {
        &self.meta
    }

    /// Look up a user table.
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables.get(name).cloned().ok_or_else(|| Error::NotFound {
            what: format!("table '{}'", name),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        name == META_TABLE_NAME || self.tables.contains_key(name)
    }

    /// Table names in no particular order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Register a table created by a committed transaction.
    pub fn register(&mut self, table: Arc<Table>) {
        self.tables.insert(table.name().to_string(), table);
    }

    /// Forget a table dropped by a committed transaction.
    pub fn unregister(&mut self, name: &str) {
        self.tables.remove(name);
    }
}

/// Create the meta root at page 0 and insert its self-describing record.
fn bootstrap(txp: &mut TxPager<'_>, meta: &Table) -> Result<()> {
    let schema = meta_schema();
    let mut root = LeafNode::empty(schema.row_size());
    root.is_root = true;
    txp.write_node(PageIndex(0), Node::Leaf(root))?;

    meta.insert_rows(
        txp,
        vec![vec![
            Value::Int4(SCHEMA_TABLE),
            Value::Varchar(META_TABLE_NAME.to_string()),
            Value::Int4(0),
            Value::Varchar(schema.to_sql()),
        ]],
    )?;
    Ok(())
}

struct CatalogRecord {
    kind: i32,
    name: String,
    root: PageIndex,
    sql: String,
}

/// Scan the meta-table into plain records, materializing spilled DDL.
fn read_records(txp: &mut TxPager<'_>, meta: &Table) -> Result<Vec<CatalogRecord>> {
    let schema = meta.schema();
    let tree = meta.tree();
    let mut records = Vec::new();
    let mut cursor = tree.seek_first(txp)?;
    while !cursor.end_of_table {
        let cell = tree.cell_at(txp, &cursor)?;
        let values = crate::row::unmarshal_values(schema, cell.null_bitmask, &cell.payload)?;
        let [kind, name, root, sql]: [Value; 4] =
            values.try_into().map_err(|_| {
                Error::corrupt("catalog.read", "meta row with unexpected arity")
            })?;
        let kind = match kind {
            Value::Int4(v) => v,
            other => {
                return Err(Error::corrupt(
                    "catalog.read",
                    format!("meta row type column holds {}", other),
                ))
            }
        };
        let name = match name {
            Value::Varchar(s) => s,
            other => {
                return Err(Error::corrupt(
                    "catalog.read",
                    format!("meta row name column holds {}", other),
                ))
            }
        };
        let root = match root {
            Value::Int4(v) if v >= 0 => PageIndex(v as u32),
            other => {
                return Err(Error::corrupt(
                    "catalog.read",
                    format!("meta row root column holds {}", other),
                ))
            }
        };
        let sql = match sql {
            Value::Varchar(s) => s,
            Value::Text(ptr) => overflow::read_chain(txp, ptr)?,
            other => {
                return Err(Error::corrupt(
                    "catalog.read",
                    format!("meta row sql column holds {}", other),
                ))
            }
        };
        records.push(CatalogRecord {
            kind,
            name,
            root,
            sql,
        });
        tree.advance(txp, &mut cursor)?;
    }
    Ok(records)
}

fn schema_from_sql(parser: &Parser, sql: &str) -> Result<TableSchema> {
    let mut statements = parser.parse(sql)?;
    if statements.len() != 1 || statements[0].kind != StatementKind::CreateTable {
        return Err(Error::corrupt(
            "catalog.load",
            format!("stored DDL is not a single CREATE TABLE: {}", sql),
        ));
    }
    let stmt = statements.remove(0);
    TableSchema::new(stmt.table_name, stmt.columns)
}

/// Allocate roots for a new table, record it in the meta-table, and return
/// the handle. The caller registers it only after the transaction commits.
pub fn create_table_tx(
    txp: &mut TxPager<'_>,
    meta: &Table,
    schema: TableSchema,
) -> Result<Table> {
    let ddl = schema.to_sql();
    if ddl.len() > META_SQL_SIZE {
        return Err(Error::bad_input(format!(
            "DDL for table '{}' exceeds the catalog's sql capacity",
            schema.name
        )));
    }

    let root = txp.get_free_page()?;
    let mut root_leaf = LeafNode::empty(schema.row_size());
    root_leaf.is_root = true;
    txp.write_node(root, Node::Leaf(root_leaf))?;

    let mut meta_rows = vec![vec![
        Value::Int4(SCHEMA_TABLE),
        Value::Varchar(schema.name.clone()),
        Value::Int4(root.0 as i32),
        Value::Varchar(ddl),
    ]];

    let pk_root = if let Some((_, col)) = schema.primary_key() {
        let pk_root = txp.get_free_page()?;
        let mut index_root = crate::node::IndexNode::empty_leaf(col.key_size());
        index_root.is_root = true;
        txp.write_node(pk_root, Node::Index(index_root))?;
        meta_rows.push(vec![
            Value::Int4(SCHEMA_PRIMARY_KEY),
            Value::Varchar(primary_key_name(&schema.name)),
            Value::Int4(pk_root.0 as i32),
            Value::Varchar(String::new()),
        ]);
        Some(pk_root)
    } else {
        None
    };

    meta.insert_rows(txp, meta_rows)?;
    debug!(
        "created table '{}' with root {} (pk root {:?})",
        schema.name, root, pk_root
    );
    Table::new(schema, root, pk_root)
}

/// Free every page the table owns and remove its catalog records. The
/// caller unregisters the handle only after the transaction commits.
pub fn drop_table_tx(txp: &mut TxPager<'_>, meta: &Table, table: &Table) -> Result<()> {
    let pages = table.collect_all_pages(txp)?;
    for page in &pages {
        txp.add_free_page(*page)?;
    }

    for name in [table.name().to_string(), primary_key_name(table.name())] {
        let mut stmt = Statement::new(StatementKind::Delete);
        stmt.table_name = META_TABLE_NAME.to_string();
        stmt.conditions = vec![Condition {
            column: "name".to_string(),
            op: CompareOp::Eq,
            value: Value::Varchar(name),
        }];
        meta.execute(txp, &stmt)?;
    }
    debug!(
        "dropped table '{}', {} pages onto the free list",
        table.name(),
        pages.len()
    );
    Ok(())
}
