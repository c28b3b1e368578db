//! An embedded relational storage engine: SQL-like tables over a single
//! paged file, with a row B+tree per table, an optional unique primary-key
//! index, chained overflow pages for oversize varchars, a header-rooted
//! free-page list, and optimistic copy-on-write transactions.

pub mod btree;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod ctx;
pub mod error;
pub mod file;
pub mod index;
pub mod node;
pub mod pager;
pub mod parser;
pub mod row;
pub mod schema;
pub mod statement;
pub mod table;
pub mod txn;
pub mod types;

pub use ctx::{CancelHandle, Ctx};
pub use error::{Error, Result};
pub use parser::Parser;
pub use row::{Row, TextPointer, Value};
pub use schema::{Column, ColumnKind, TableSchema};
pub use statement::{Statement, StatementKind, StatementResult};
pub use types::{PageIndex, TxId};

use std::path::Path;
use std::sync::{Mutex, RwLock};

use log::warn;

use catalog::Catalog;
use pager::Pager;
use table::Table;
use txn::{run_in_transaction, Transaction, TransactionManager, TxPager};

/// High-level database handle: one file, one catalog, one writer at a time.
#[derive(Debug)]
pub struct Database {
    pager: Pager,
    mgr: TransactionManager,
    parser: Parser,
    catalog: RwLock<Catalog>,
    /// Transaction opened by an explicit BEGIN, consumed by COMMIT/ROLLBACK.
    session: Mutex<Option<Transaction>>,
}

impl Database {
    /// Open a database file, creating and bootstrapping it when absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let pager = Pager::open(path.as_ref())?;
        let mgr = TransactionManager::new();
        let parser = Parser::new();
        let ctx = Ctx::background();
        let catalog = Catalog::open(&pager, &mgr, &ctx, &parser)?;
        Ok(Self {
            pager,
            mgr,
            parser,
            catalog: RwLock::new(catalog),
            session: Mutex::new(None),
        })
    }

    /// Parse and execute a SQL script, one result per statement.
    pub fn execute(&self, ctx: &Ctx, sql: &str) -> Result<Vec<StatementResult>> {
        let statements = self.parser.parse(sql)?;
        let mut results = Vec::with_capacity(statements.len());
        for stmt in &statements {
            results.push(self.execute_statement(ctx, stmt)?);
        }
        Ok(results)
    }

    /// Execute one statement. Without an open session transaction the
    /// statement runs in its own transaction; inside one, it joins it.
    pub fn execute_statement(&self, ctx: &Ctx, stmt: &Statement) -> Result<StatementResult> {
        match stmt.kind {
            StatementKind::Begin => self.begin(),
            StatementKind::Commit => self.commit(),
            StatementKind::Rollback => self.rollback(),
            StatementKind::CreateTable => self.create_table(ctx, stmt),
            StatementKind::DropTable => self.drop_table(ctx, stmt),
            StatementKind::Insert
            | StatementKind::Select
            | StatementKind::Update
            | StatementKind::Delete => {
                if stmt.table_name == config::META_TABLE_NAME
                    && stmt.kind != StatementKind::Select
                {
                    return Err(Error::bad_input("the catalog table is read-only"));
                }
                let table = self.resolve_table(&stmt.table_name)?;
                let _write_guard = match stmt.kind {
                    StatementKind::Select => None,
                    _ => Some(table.lock_writes()),
                };
                self.with_statement_tx(ctx, |txp| table.execute(txp, stmt))
            }
        }
    }

    /// Execute several statements atomically: all commit or none do.
    /// Transaction verbs are not allowed inside.
    pub fn execute_in_transaction(
        &self,
        ctx: &Ctx,
        statements: &[Statement],
    ) -> Result<Vec<StatementResult>> {
        for stmt in statements {
            if matches!(
                stmt.kind,
                StatementKind::Begin | StatementKind::Commit | StatementKind::Rollback
            ) {
                return Err(Error::bad_input(
                    "transaction verbs cannot appear inside execute_in_transaction",
                ));
            }
            if matches!(stmt.kind, StatementKind::CreateTable | StatementKind::DropTable) {
                return Err(Error::bad_input(
                    "DDL runs in its own transaction, not inside execute_in_transaction",
                ));
            }
            if stmt.table_name == config::META_TABLE_NAME && stmt.kind != StatementKind::Select {
                return Err(Error::bad_input("the catalog table is read-only"));
            }
        }

        let mut tables = Vec::with_capacity(statements.len());
        for stmt in statements {
            tables.push(self.resolve_table(&stmt.table_name)?);
        }

        run_in_transaction(&self.pager, &self.mgr, ctx, |txp| {
            let mut results = Vec::with_capacity(statements.len());
            for (stmt, table) in statements.iter().zip(&tables) {
                let _write_guard = match stmt.kind {
                    StatementKind::Select => None,
                    _ => Some(table.lock_writes()),
                };
                results.push(table.execute(txp, stmt)?);
            }
            Ok(results)
        })
    }

    /// Flush every cached page in ascending order. Fails if any flush fails;
    /// an open session transaction is rolled back first.
    pub fn close(&self, ctx: &Ctx) -> Result<()> {
        if let Some(mut tx) = self.session.lock().expect("session lock poisoned").take() {
            self.mgr.rollback(&mut tx);
        }
        self.pager.flush_all(ctx)
    }

    /// Names of the user tables currently in the catalog.
    pub fn table_names(&self) -> Vec<String> {
        self.catalog
            .read()
            .expect("catalog lock poisoned")
            .table_names()
    }

    fn resolve_table(&self, name: &str) -> Result<std::sync::Arc<Table>> {
        if name == config::META_TABLE_NAME {
            return Ok(std::sync::Arc::clone(
                self.catalog.read().expect("catalog lock poisoned").meta(),
            ));
        }
        self.catalog
            .read()
            .expect("catalog lock poisoned")
            .table(name)
    }

    fn begin(&self) -> Result<StatementResult> {
        let mut session = self.session.lock().expect("session lock poisoned");
        if session.is_some() {
            return Err(Error::bad_input("a transaction is already open"));
        }
        *session = Some(self.mgr.begin());
        Ok(StatementResult::empty())
    }

    fn commit(&self) -> Result<StatementResult> {
        let mut session = self.session.lock().expect("session lock poisoned");
        match session.take() {
            Some(mut tx) => {
                self.mgr.commit(&mut tx, &self.pager)?;
                Ok(StatementResult::empty())
            }
            None => Err(Error::bad_input("no open transaction to commit")),
        }
    }

    fn rollback(&self) -> Result<StatementResult> {
        let mut session = self.session.lock().expect("session lock poisoned");
        match session.take() {
            Some(mut tx) => {
                self.mgr.rollback(&mut tx);
                Ok(StatementResult::empty())
            }
            None => Err(Error::bad_input("no open transaction to roll back")),
        }
    }

    /// DDL always runs in its own transaction; the catalog map changes only
    /// after that transaction commits.
    fn create_table(&self, ctx: &Ctx, stmt: &Statement) -> Result<StatementResult> {
        let schema = TableSchema::new(stmt.table_name.clone(), stmt.columns.clone())?;
        let mut cat = self.catalog.write().expect("catalog lock poisoned");
        if cat.contains(&schema.name) {
            return Err(Error::bad_input(format!(
                "table '{}' already exists",
                schema.name
            )));
        }
        let meta = std::sync::Arc::clone(cat.meta());
        let table = run_in_transaction(&self.pager, &self.mgr, ctx, |txp| {
            catalog::create_table_tx(txp, &meta, schema.clone())
        })?;
        cat.register(std::sync::Arc::new(table));
        Ok(StatementResult::empty())
    }

    fn drop_table(&self, ctx: &Ctx, stmt: &Statement) -> Result<StatementResult> {
        if stmt.table_name == config::META_TABLE_NAME {
            return Err(Error::bad_input("the catalog table cannot be dropped"));
        }
        let mut cat = self.catalog.write().expect("catalog lock poisoned");
        let table = cat.table(&stmt.table_name)?;
        let meta = std::sync::Arc::clone(cat.meta());
        run_in_transaction(&self.pager, &self.mgr, ctx, |txp| {
            let _write_guard = table.lock_writes();
            catalog::drop_table_tx(txp, &meta, &table)
        })?;
        cat.unregister(&stmt.table_name);
        Ok(StatementResult::empty())
    }

    /// Run `f` in the session transaction when one is open (an error rolls
    /// the whole session back), otherwise in a fresh one-shot transaction.
    fn with_statement_tx<T>(
        &self,
        ctx: &Ctx,
        f: impl FnOnce(&mut TxPager<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut session = self.session.lock().expect("session lock poisoned");
        if let Some(tx) = session.as_mut() {
            let outcome = {
                let mut txp = TxPager::new(&self.pager, &self.mgr, ctx, tx);
                ctx.check().and_then(|()| f(&mut txp))
            };
            if outcome.is_err() {
                if let Some(mut tx) = session.take() {
                    self.mgr.rollback(&mut tx);
                }
            }
            return outcome;
        }
        drop(session);
        run_in_transaction(&self.pager, &self.mgr, ctx, f)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close(&Ctx::background()) {
            warn!("flush on close failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_OVERFLOW_PAGE_DATA;
    use crate::row::unmarshal_values;
    use std::path::PathBuf;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn open_db(dir: &tempfile::TempDir, name: &str) -> (Database, PathBuf) {
        init_logging();
        let path = dir.path().join(name);
        (Database::open(&path).unwrap(), path)
    }

    /// Collect a statement's rows eagerly.
    fn rows_of(result: StatementResult) -> Vec<Row> {
        result.rows.collect()
    }

    fn select_all(db: &Database, ctx: &Ctx, sql: &str) -> Vec<Row> {
        let mut results = db.execute(ctx, sql).unwrap();
        assert_eq!(results.len(), 1);
        rows_of(results.remove(0))
    }

    #[test]
    fn users_scenario_with_nulls_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Ctx::background();
        let (db, path) = open_db(&dir, "users.db");

        db.execute(
            &ctx,
            "CREATE TABLE users (id INT8 PRIMARY KEY, email VARCHAR(255), age INT4 NULLABLE)",
        )
        .unwrap();
        db.execute(
            &ctx,
            "INSERT INTO users VALUES (1, 'a@x', 30), (2, 'b@x', NULL)",
        )
        .unwrap();

        let rows = select_all(&db, &ctx, "SELECT age FROM users WHERE id = 2");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values, vec![Value::Null]);

        let rows = select_all(&db, &ctx, "SELECT COUNT(*) FROM users WHERE age IS NULL");
        assert_eq!(rows[0].values, vec![Value::Int8(1)]);

        db.close(&ctx).unwrap();
        drop(db);

        let db = Database::open(&path).unwrap();
        let rows = select_all(&db, &ctx, "SELECT age FROM users WHERE id = 2");
        assert_eq!(rows[0].values, vec![Value::Null]);
        let rows = select_all(&db, &ctx, "SELECT COUNT(*) FROM users WHERE age IS NULL");
        assert_eq!(rows[0].values, vec![Value::Int8(1)]);
        let rows = select_all(&db, &ctx, "SELECT * FROM users");
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].values,
            vec![
                Value::Int8(1),
                Value::Varchar("a@x".to_string()),
                Value::Int4(30)
            ]
        );
    }

    #[test]
    fn overflow_varchar_round_trips_and_frees_its_chain() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Ctx::background();
        let (db, _) = open_db(&dir, "blobs.db");

        db.execute(&ctx, "CREATE TABLE notes (id INT8 PRIMARY KEY, body VARCHAR(8192))")
            .unwrap();
        let body: String = ('a'..='z')
            .cycle()
            .take(MAX_OVERFLOW_PAGE_DATA + 100)
            .collect();
        db.execute(&ctx, &format!("INSERT INTO notes VALUES (7, '{}')", body))
            .unwrap();

        // The stored cell carries a text pointer, not the inline value.
        let table = db.resolve_table("notes").unwrap();
        run_in_transaction(&db.pager, &db.mgr, &ctx, |txp| {
            let (cursor, found) = table.tree().seek(txp, 1)?;
            assert!(found);
            let cell = table.tree().cell_at(txp, &cursor)?;
            let values = unmarshal_values(table.schema(), cell.null_bitmask, &cell.payload)?;
            match &values[1] {
                Value::Text(ptr) => {
                    assert_eq!(ptr.length as usize, MAX_OVERFLOW_PAGE_DATA + 100);
                    assert!(!ptr.first_page.is_zero());
                }
                other => panic!("expected a text pointer, found {}", other),
            }
            Ok(())
        })
        .unwrap();

        let rows = select_all(&db, &ctx, "SELECT body FROM notes WHERE id = 7");
        assert_eq!(rows[0].values, vec![Value::Varchar(body.clone())]);

        // Predicates see the materialized string too.
        let rows = select_all(
            &db,
            &ctx,
            &format!("SELECT COUNT(*) FROM notes WHERE body = '{}'", body),
        );
        assert_eq!(rows[0].values, vec![Value::Int8(1)]);

        let free_before = db.pager.header().free_page_count;
        db.execute(&ctx, "DELETE FROM notes WHERE id = 7").unwrap();
        let free_after = db.pager.header().free_page_count;
        // The two chain pages came back, and possibly tree pages with them.
        assert!(free_after >= free_before + 2);

        let rows = select_all(&db, &ctx, "SELECT COUNT(*) FROM notes");
        assert_eq!(rows[0].values, vec![Value::Int8(0)]);
    }

    #[test]
    fn dropped_table_pages_land_on_the_free_list_and_get_reused() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Ctx::background();
        let (db, _) = open_db(&dir, "drop.db");

        db.execute(&ctx, "CREATE TABLE keep (id INT8 PRIMARY KEY, v VARCHAR(64))")
            .unwrap();
        db.execute(&ctx, "CREATE TABLE victim (id INT8 PRIMARY KEY, v VARCHAR(8192))")
            .unwrap();
        let long = "v".repeat(MAX_OVERFLOW_PAGE_DATA + 10);
        for i in 0..30 {
            db.execute(
                &ctx,
                &format!("INSERT INTO victim VALUES ({}, '{}')", i, long),
            )
            .unwrap();
        }
        let total_before = db.pager.total_pages();

        db.execute(&ctx, "DROP TABLE victim").unwrap();
        let header = db.pager.header();
        // Row tree pages, index pages, and 60 overflow pages all freed.
        assert!(header.free_page_count >= 60);
        assert!(db.execute(&ctx, "SELECT * FROM victim").is_err());

        // New tables and rows reuse freed pages instead of growing the file.
        db.execute(&ctx, "CREATE TABLE fresh (id INT8 PRIMARY KEY, v VARCHAR(64))")
            .unwrap();
        for i in 0..20 {
            db.execute(&ctx, &format!("INSERT INTO fresh VALUES ({}, 'x')", i))
                .unwrap();
        }
        assert!(db.pager.total_pages() <= total_before);
        assert!(db.pager.header().free_page_count < header.free_page_count);

        // The kept table is untouched.
        db.execute(&ctx, "INSERT INTO keep VALUES (1, 'ok')").unwrap();
        let rows = select_all(&db, &ctx, "SELECT v FROM keep WHERE id = 1");
        assert_eq!(rows[0].values, vec![Value::Varchar("ok".to_string())]);
    }

    #[test]
    fn random_churn_deletes_until_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Ctx::background();
        let (db, _) = open_db(&dir, "churn.db");

        db.execute(&ctx, "CREATE TABLE t (n INT8, tag VARCHAR(16))").unwrap();
        let mut remaining: Vec<i64> = {
            let mut v: Vec<i64> = (1..=100).collect();
            let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
            for i in (1..v.len()).rev() {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (seed >> 33) as usize % (i + 1);
                v.swap(i, j);
            }
            v
        };
        for &n in &remaining {
            db.execute(&ctx, &format!("INSERT INTO t VALUES ({}, 'tag{}')", n, n % 7))
                .unwrap();
        }

        let mut threshold = 100i64;
        while !remaining.is_empty() {
            threshold -= 13;
            db.execute(&ctx, &format!("DELETE FROM t WHERE n > {}", threshold))
                .unwrap();
            remaining.retain(|&n| n <= threshold);

            let rows = select_all(&db, &ctx, "SELECT n FROM t");
            // The scan visits rows in ascending row-id order.
            let ids: Vec<u64> = rows.iter().map(|r| r.id).collect();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));

            let mut got: Vec<i64> = rows
                .iter()
                .map(|r| match r.values[0] {
                    Value::Int8(v) => v,
                    ref other => panic!("unexpected value {:?}", other),
                })
                .collect();
            got.sort_unstable();
            let mut expected = remaining.clone();
            expected.sort_unstable();
            assert_eq!(got, expected);

            if threshold <= 0 {
                assert!(remaining.is_empty());
            }
        }
        let rows = select_all(&db, &ctx, "SELECT COUNT(*) FROM t");
        assert_eq!(rows[0].values, vec![Value::Int8(0)]);
    }

    #[test]
    fn reopen_recovers_catalog_roots_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Ctx::background();
        let (db, path) = open_db(&dir, "reopen.db");

        db.execute(&ctx, "CREATE TABLE a (id INT8 PRIMARY KEY, v VARCHAR(32))")
            .unwrap();
        db.execute(&ctx, "CREATE TABLE b (x FLOAT8 NULLABLE, ok BOOLEAN)")
            .unwrap();
        for i in 0..50 {
            db.execute(&ctx, &format!("INSERT INTO a VALUES ({}, 'row{}')", i, i))
                .unwrap();
        }
        db.execute(&ctx, "INSERT INTO b VALUES (2.5, TRUE), (NULL, FALSE)")
            .unwrap();
        db.close(&ctx).unwrap();
        drop(db);

        let db = Database::open(&path).unwrap();
        let mut names = db.table_names();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

        // Point lookups go through the recovered primary-key root.
        let rows = select_all(&db, &ctx, "SELECT v FROM a WHERE id = 37");
        assert_eq!(rows[0].values, vec![Value::Varchar("row37".to_string())]);

        let rows = select_all(&db, &ctx, "SELECT * FROM b");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].values, vec![Value::Null, Value::Bool(false)]);

        // Row ids continue past the recovered maximum.
        db.execute(&ctx, "INSERT INTO a VALUES (100, 'later')").unwrap();
        let rows = select_all(&db, &ctx, "SELECT COUNT(*) FROM a");
        assert_eq!(rows[0].values, vec![Value::Int8(51)]);
    }

    #[test]
    fn duplicate_primary_key_rejected_and_tree_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Ctx::background();
        let (db, _) = open_db(&dir, "dup.db");

        db.execute(&ctx, "CREATE TABLE t (id INT8 PRIMARY KEY, v VARCHAR(8))")
            .unwrap();
        db.execute(&ctx, "INSERT INTO t VALUES (1, 'one'), (2, 'two')")
            .unwrap();

        let err = db
            .execute(&ctx, "INSERT INTO t VALUES (3, 'three'), (2, 'again')")
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));

        // The failed batch rolled back in full: no row 3 either.
        let rows = select_all(&db, &ctx, "SELECT id, v FROM t");
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[1].values,
            vec![Value::Int8(2), Value::Varchar("two".to_string())]
        );
    }

    #[test]
    fn update_changes_values_and_primary_keys() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Ctx::background();
        let (db, _) = open_db(&dir, "upd.db");

        db.execute(&ctx, "CREATE TABLE t (id INT8 PRIMARY KEY, v VARCHAR(16), n INT4 NULLABLE)")
            .unwrap();
        db.execute(&ctx, "INSERT INTO t VALUES (1, 'a', 10), (2, 'b', 20), (3, 'c', 30)")
            .unwrap();

        let mut results = db
            .execute(&ctx, "UPDATE t SET n = NULL, v = 'x' WHERE n >= 20")
            .unwrap();
        assert_eq!(results.remove(0).rows_affected, 2);

        let rows = select_all(&db, &ctx, "SELECT v FROM t WHERE n IS NULL");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].values, vec![Value::Varchar("x".to_string())]);

        // Moving a primary key re-keys the index.
        db.execute(&ctx, "UPDATE t SET id = 9 WHERE id = 1").unwrap();
        assert!(select_all(&db, &ctx, "SELECT * FROM t WHERE id = 1").is_empty());
        let rows = select_all(&db, &ctx, "SELECT v FROM t WHERE id = 9");
        assert_eq!(rows[0].values, vec![Value::Varchar("a".to_string())]);

        let err = db
            .execute(&ctx, "UPDATE t SET id = 2 WHERE id = 9")
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
    }

    #[test]
    fn limit_and_offset_shape_results() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Ctx::background();
        let (db, _) = open_db(&dir, "lim.db");

        db.execute(&ctx, "CREATE TABLE t (n INT8)").unwrap();
        for n in 1..=10 {
            db.execute(&ctx, &format!("INSERT INTO t VALUES ({})", n)).unwrap();
        }

        let rows = select_all(&db, &ctx, "SELECT n FROM t LIMIT 3");
        assert_eq!(
            rows.iter().map(|r| r.values[0].clone()).collect::<Vec<_>>(),
            vec![Value::Int8(1), Value::Int8(2), Value::Int8(3)]
        );

        let rows = select_all(&db, &ctx, "SELECT n FROM t LIMIT 3 OFFSET 8");
        assert_eq!(
            rows.iter().map(|r| r.values[0].clone()).collect::<Vec<_>>(),
            vec![Value::Int8(9), Value::Int8(10)]
        );

        // LIMIT 0 means no limit, matching the engine's convention.
        let rows = select_all(&db, &ctx, "SELECT n FROM t LIMIT 0");
        assert_eq!(rows.len(), 10);
    }

    #[test]
    fn session_transactions_commit_and_roll_back() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Ctx::background();
        let (db, _) = open_db(&dir, "session.db");

        db.execute(&ctx, "CREATE TABLE t (n INT8)").unwrap();

        db.execute(&ctx, "BEGIN; INSERT INTO t VALUES (1); INSERT INTO t VALUES (2); COMMIT")
            .unwrap();
        assert_eq!(select_all(&db, &ctx, "SELECT * FROM t").len(), 2);

        db.execute(&ctx, "BEGIN; INSERT INTO t VALUES (3); ROLLBACK").unwrap();
        assert_eq!(select_all(&db, &ctx, "SELECT * FROM t").len(), 2);

        assert!(db.execute(&ctx, "COMMIT").is_err());
        assert!(db.execute(&ctx, "BEGIN; BEGIN").is_err());
        db.execute(&ctx, "ROLLBACK").unwrap();
    }

    #[test]
    fn execute_in_transaction_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Ctx::background();
        let (db, _) = open_db(&dir, "atomic.db");

        db.execute(&ctx, "CREATE TABLE t (id INT8 PRIMARY KEY)").unwrap();
        db.execute(&ctx, "INSERT INTO t VALUES (5)").unwrap();

        let parser = Parser::new();
        let good = parser.parse("INSERT INTO t VALUES (6)").unwrap();
        let bad = parser.parse("INSERT INTO t VALUES (5)").unwrap();
        let statements: Vec<Statement> =
            good.into_iter().chain(bad.into_iter()).collect();

        let err = db.execute_in_transaction(&ctx, &statements).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
        // Nothing from the failed batch is visible.
        assert_eq!(select_all(&db, &ctx, "SELECT * FROM t").len(), 1);

        let ok = parser
            .parse("INSERT INTO t VALUES (7); SELECT COUNT(*) FROM t")
            .unwrap();
        let mut results = db.execute_in_transaction(&ctx, &ok).unwrap();
        let count_rows = rows_of(results.remove(1));
        assert_eq!(count_rows[0].values, vec![Value::Int8(2)]);
    }

    #[test]
    fn statement_errors_name_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Ctx::background();
        let (db, _) = open_db(&dir, "errs.db");

        db.execute(&ctx, "CREATE TABLE t (n INT4, v VARCHAR(4))").unwrap();

        for sql in [
            "INSERT INTO t VALUES (1)",
            "INSERT INTO t VALUES (1, 'x', 2)",
            "INSERT INTO t VALUES ('nope', 'x')",
            "INSERT INTO t VALUES (1, 'toolong')",
            "INSERT INTO t VALUES (9999999999, 'x')",
            "SELECT missing FROM t",
            "SELECT * FROM t WHERE missing = 1",
            "UPDATE t SET missing = 1",
        ] {
            let err = db.execute(&ctx, sql).unwrap_err();
            assert!(matches!(err, Error::BadInput { .. }), "sql: {}", sql);
        }

        assert!(matches!(
            db.execute(&ctx, "SELECT * FROM absent"),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            db.execute(&ctx, "CREATE TABLE t (n INT4)"),
            Err(Error::BadInput { .. })
        ));
        assert!(matches!(
            db.execute(&ctx, "DROP TABLE minisql_schema"),
            Err(Error::BadInput { .. })
        ));
    }

    #[test]
    fn cancelled_statement_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Ctx::background();
        let (db, _) = open_db(&dir, "cancel.db");
        db.execute(&ctx, "CREATE TABLE t (n INT8)").unwrap();

        let (cancelled, handle) = Ctx::cancellable();
        handle.cancel();
        let err = db.execute(&cancelled, "INSERT INTO t VALUES (1)").unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(select_all(&db, &ctx, "SELECT * FROM t").len(), 0);
    }

    #[test]
    fn free_list_survives_reopen_and_feeds_allocations() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Ctx::background();
        let (db, path) = open_db(&dir, "freelist.db");

        db.execute(&ctx, "CREATE TABLE t (n INT8, v VARCHAR(200))").unwrap();
        for n in 1..=60 {
            db.execute(&ctx, &format!("INSERT INTO t VALUES ({}, 'x')", n)).unwrap();
        }
        db.execute(&ctx, "DELETE FROM t WHERE n > 5").unwrap();
        let freed = db.pager.header().free_page_count;
        assert!(freed > 0);
        let total = db.pager.total_pages();
        db.close(&ctx).unwrap();
        drop(db);

        let db = Database::open(&path).unwrap();
        assert_eq!(db.pager.header().free_page_count, freed);
        assert_eq!(db.pager.total_pages(), total);

        // New inserts consume the recovered free list before growing the
        // file.
        for n in 100..=140 {
            db.execute(&ctx, &format!("INSERT INTO t VALUES ({}, 'y')", n)).unwrap();
        }
        assert!(db.pager.header().free_page_count < freed);
        assert_eq!(db.pager.total_pages(), total);

        let rows = select_all(&db, &ctx, "SELECT COUNT(*) FROM t");
        assert_eq!(rows[0].values, vec![Value::Int8(5 + 41)]);
    }

    #[test]
    fn concurrent_readers_alongside_a_writer() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Ctx::background();
        let (db, _) = open_db(&dir, "mt.db");
        db.execute(&ctx, "CREATE TABLE t (n INT8)").unwrap();

        std::thread::scope(|scope| {
            let writer = scope.spawn(|| {
                let ctx = Ctx::background();
                for n in 1..=50 {
                    db.execute(&ctx, &format!("INSERT INTO t VALUES ({})", n))
                        .unwrap();
                }
            });
            for _ in 0..2 {
                scope.spawn(|| {
                    let ctx = Ctx::background();
                    for _ in 0..30 {
                        // A reader racing the committing writer may lose the
                        // optimistic validation; that is the contract.
                        match db.execute(&ctx, "SELECT COUNT(*) FROM t") {
                            Ok(_) | Err(Error::TxConflict { .. }) => {}
                            Err(other) => panic!("unexpected error: {}", other),
                        }
                    }
                });
            }
            writer.join().unwrap();
        });

        let rows = select_all(&db, &ctx, "SELECT COUNT(*) FROM t");
        assert_eq!(rows[0].values, vec![Value::Int8(50)]);
    }

    #[test]
    fn meta_table_is_selectable_but_immutable_from_sql() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Ctx::background();
        let (db, _) = open_db(&dir, "meta.db");
        db.execute(&ctx, "CREATE TABLE t (n INT8)").unwrap();

        let rows = select_all(&db, &ctx, "SELECT name FROM minisql_schema");
        let names: Vec<String> = rows
            .iter()
            .map(|r| match &r.values[0] {
                Value::Varchar(s) => s.clone(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert!(names.contains(&"minisql_schema".to_string()));
        assert!(names.contains(&"t".to_string()));

        let err = db
            .execute(&ctx, "DELETE FROM minisql_schema WHERE name = 't'")
            .unwrap_err();
        assert!(matches!(err, Error::BadInput { .. }));
    }
}
