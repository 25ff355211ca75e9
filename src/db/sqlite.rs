//! SQLite backend for footprint-db.
//!
//! Implements the durable store using rusqlite (bundled). The connection is
//! protected by a `parking_lot::ReentrantMutex<RefCell<Connection>>` so that
//! `transaction()` can hold the lock while calling the closure, which also
//! needs to lock in order to execute SQL.
//!
//! Crud capture works without parsing SQL: every synced table gets generated
//! AFTER INSERT/UPDATE/DELETE triggers that append to `fp_crud`. The UPDATE
//! trigger calls the registered `fp_json_diff` scalar function so PATCH
//! entries carry only the changed columns, and all three triggers are gated
//! on `fp_capture_enabled()` so remote merges never re-enter the queue.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde_json::Value;

use crate::db::crud::{CrudEntry, CrudOp, CrudTransaction};
use crate::error::{FootprintDbError, Result, StorageError};
use crate::schema::{Schema, Table};
use crate::types::{RemoteChange, RemoteOp};

// ============================================================================
// Value helpers
// ============================================================================

/// Convert a `serde_json::Value` to a `rusqlite::types::Value` for binding.
pub(crate) fn json_value_to_sql(v: &Value) -> rusqlite::types::Value {
    match v {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(if *b { 1 } else { 0 }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        // Arrays and objects stored as JSON strings in SQLite
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

/// Convert a `rusqlite::types::Value` read from a row to a `serde_json::Value`.
pub(crate) fn sql_value_to_json(v: rusqlite::types::Value) -> Value {
    match v {
        rusqlite::types::Value::Null => Value::Null,
        rusqlite::types::Value::Integer(i) => Value::from(i),
        rusqlite::types::Value::Real(f) => {
            serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        rusqlite::types::Value::Text(s) => Value::String(s),
        rusqlite::types::Value::Blob(b) => {
            // Blobs do not round-trip through the JSON row model; surfaced as
            // an array of numbers for completeness.
            Value::Array(b.into_iter().map(Value::from).collect())
        }
    }
}

/// Map a rusqlite error to a `FootprintDbError`.
fn storage_err(e: rusqlite::Error) -> FootprintDbError {
    FootprintDbError::Storage(StorageError::Sqlite(e))
}

/// JSON object diff used by the generated UPDATE triggers: returns the
/// entries of `new` whose values differ from `old` (including set-to-null).
fn json_diff(old: &str, new: &str) -> String {
    let old_v: Value = serde_json::from_str(old).unwrap_or(Value::Null);
    let new_v: Value = serde_json::from_str(new).unwrap_or(Value::Null);

    let mut out = serde_json::Map::new();
    if let (Some(old_map), Some(new_map)) = (old_v.as_object(), new_v.as_object()) {
        for (key, new_val) in new_map {
            if old_map.get(key) != Some(new_val) {
                out.insert(key.clone(), new_val.clone());
            }
        }
    }
    Value::Object(out).to_string()
}

/// Quote an identifier for embedding in generated SQL.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// ============================================================================
// SqliteBackend
// ============================================================================

/// The embedded durable store: user tables, mutation queue, metadata and
/// attachment records, all in one SQLite database.
///
/// `ReentrantMutex` allows `transaction()` to hold the guard while the
/// closure re-acquires it for individual SQL operations. All methods are
/// synchronous; async callers should be aware these calls block the current
/// thread.
pub struct SqliteBackend {
    conn: ReentrantMutex<RefCell<rusqlite::Connection>>,
    schema: Schema,
    capture_enabled: Arc<AtomicBool>,
    /// Tables written since the last `take_changed_tables`, fed by the
    /// SQLite update hook (covers local writes and remote merges alike).
    changed_tables: Arc<Mutex<HashSet<String>>>,
    closed: AtomicBool,
}

impl SqliteBackend {
    /// Open a file-backed database and initialize the schema.
    pub fn open(path: &str, schema: Schema) -> Result<Self> {
        let conn = rusqlite::Connection::open(path).map_err(storage_err)?;
        Self::with_connection(conn, schema)
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory(schema: Schema) -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(storage_err)?;
        Self::with_connection(conn, schema)
    }

    fn with_connection(conn: rusqlite::Connection, schema: Schema) -> Result<Self> {
        let capture_enabled = Arc::new(AtomicBool::new(true));
        let changed_tables = Arc::new(Mutex::new(HashSet::new()));

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;
             PRAGMA foreign_keys=ON;",
        )
        .map_err(storage_err)?;

        Self::register_functions(&conn, &capture_enabled)?;
        Self::register_update_hook(&conn, &changed_tables);

        let backend = Self {
            conn: ReentrantMutex::new(RefCell::new(conn)),
            schema,
            capture_enabled,
            changed_tables,
            closed: AtomicBool::new(false),
        };
        backend.initialize()?;
        Ok(backend)
    }

    fn register_functions(
        conn: &rusqlite::Connection,
        capture_enabled: &Arc<AtomicBool>,
    ) -> Result<()> {
        let flag = Arc::clone(capture_enabled);
        // Not DETERMINISTIC: reads engine state. Trigger WHEN clauses may
        // call non-deterministic functions, unlike index expressions.
        conn.create_scalar_function("fp_capture_enabled", 0, FunctionFlags::SQLITE_UTF8, {
            move |_ctx| Ok(if flag.load(Ordering::SeqCst) { 1i64 } else { 0i64 })
        })
        .map_err(storage_err)?;

        conn.create_scalar_function(
            "fp_json_diff",
            2,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let old: String = ctx.get(0)?;
                let new: String = ctx.get(1)?;
                Ok(json_diff(&old, &new))
            },
        )
        .map_err(storage_err)?;
        Ok(())
    }

    fn register_update_hook(
        conn: &rusqlite::Connection,
        changed_tables: &Arc<Mutex<HashSet<String>>>,
    ) {
        let changed = Arc::clone(changed_tables);
        conn.update_hook(Some(
            move |_action: rusqlite::hooks::Action, _db: &str, table: &str, _rowid: i64| {
                changed.lock().insert(table.to_string());
            },
        ));
    }

    /// Create internal tables, user tables and crud-capture triggers.
    fn initialize(&self) -> Result<()> {
        let guard = self.conn.lock();
        let conn = guard.borrow();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS fp_crud (
                seq     INTEGER PRIMARY KEY AUTOINCREMENT,
                tx_id   INTEGER,
                op      TEXT NOT NULL,
                tbl     TEXT NOT NULL,
                row_id  TEXT NOT NULL,
                data    TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_fp_crud_tx ON fp_crud(tx_id);
            CREATE TABLE IF NOT EXISTS fp_meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS fp_attachments (
                id         TEXT PRIMARY KEY,
                filename   TEXT NOT NULL,
                media_type TEXT,
                state      INTEGER NOT NULL,
                has_local  INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );",
        )
        .map_err(storage_err)?;

        for table in &self.schema.tables {
            conn.execute_batch(&Self::table_ddl(table)).map_err(storage_err)?;
        }
        for table in self.schema.synced_tables() {
            conn.execute_batch(&Self::trigger_ddl(table)).map_err(storage_err)?;
        }
        Ok(())
    }

    fn table_ddl(table: &Table) -> String {
        let mut cols = vec!["id TEXT PRIMARY KEY NOT NULL".to_string()];
        for c in &table.columns {
            cols.push(format!("{} {}", quote_ident(&c.name), c.column_type.sql_type()));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({});",
            quote_ident(&table.name),
            cols.join(", ")
        )
    }

    /// Generated crud-capture triggers for one synced table.
    fn trigger_ddl(table: &Table) -> String {
        let tbl = &table.name;
        let qtbl = quote_ident(tbl);

        let json_object = |prefix: &str| -> String {
            if table.columns.is_empty() {
                "json_object()".to_string()
            } else {
                let pairs: Vec<String> = table
                    .columns
                    .iter()
                    .map(|c| format!("'{}', {prefix}.{}", c.name, quote_ident(&c.name)))
                    .collect();
                format!("json_object({})", pairs.join(", "))
            }
        };
        let new_obj = json_object("NEW");
        let old_obj = json_object("OLD");

        format!(
            "CREATE TRIGGER IF NOT EXISTS fp_trigger_{tbl}_insert
             AFTER INSERT ON {qtbl} WHEN fp_capture_enabled()
             BEGIN
               INSERT INTO fp_crud (op, tbl, row_id, data)
               VALUES ('PUT', '{tbl}', NEW.id, {new_obj});
             END;
             CREATE TRIGGER IF NOT EXISTS fp_trigger_{tbl}_update
             AFTER UPDATE ON {qtbl} WHEN fp_capture_enabled()
             BEGIN
               INSERT INTO fp_crud (op, tbl, row_id, data)
               VALUES ('PATCH', '{tbl}', NEW.id, fp_json_diff({old_obj}, {new_obj}));
             END;
             CREATE TRIGGER IF NOT EXISTS fp_trigger_{tbl}_delete
             AFTER DELETE ON {qtbl} WHEN fp_capture_enabled()
             BEGIN
               INSERT INTO fp_crud (op, tbl, row_id, data)
               VALUES ('DELETE', '{tbl}', OLD.id, NULL);
             END;"
        )
    }

    // -----------------------------------------------------------------------
    // Raw statement execution
    // -----------------------------------------------------------------------

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::Closed.into())
        } else {
            Ok(())
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Execute a single statement, returning rows affected.
    pub(crate) fn execute_raw(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.check_open()?;
        let guard = self.conn.lock();
        let conn = guard.borrow();
        conn.execute(sql, params_from_iter(params.iter().map(json_value_to_sql)))
            .map_err(storage_err)
    }

    /// Run a query, returning each row as a JSON object keyed by column name.
    pub(crate) fn query_raw(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>> {
        self.check_open()?;
        let guard = self.conn.lock();
        let conn = guard.borrow();
        let mut stmt = conn.prepare(sql).map_err(storage_err)?;
        let col_names: Vec<String> =
            stmt.column_names().iter().map(|s| s.to_string()).collect();

        let mut rows = stmt
            .query(params_from_iter(params.iter().map(json_value_to_sql)))
            .map_err(storage_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(storage_err)? {
            let mut obj = serde_json::Map::new();
            for (i, name) in col_names.iter().enumerate() {
                let v: rusqlite::types::Value = row.get(i).map_err(storage_err)?;
                obj.insert(name.clone(), sql_value_to_json(v));
            }
            out.push(Value::Object(obj));
        }
        Ok(out)
    }

    /// Execute a closure inside a backend transaction.
    ///
    /// Uses a SAVEPOINT so this composes with outer transactions. Each
    /// invocation gets a unique name to avoid collisions when nested.
    /// ReentrantMutex lets the closure re-acquire the lock for its SQL calls.
    pub(crate) fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        thread_local! {
            static SP_COUNTER: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
        }
        let sp_name = SP_COUNTER.with(|c| {
            let n = c.get();
            c.set(n + 1);
            format!("fp_sp_{n}")
        });

        let guard = self.conn.lock();
        guard
            .borrow()
            .execute_batch(&format!("SAVEPOINT {sp_name};"))
            .map_err(storage_err)?;

        match f(self) {
            Ok(v) => {
                guard
                    .borrow()
                    .execute_batch(&format!("RELEASE SAVEPOINT {sp_name};"))
                    .map_err(|e| {
                        let _ = guard
                            .borrow()
                            .execute_batch(&format!("ROLLBACK TO SAVEPOINT {sp_name};"));
                        storage_err(e)
                    })?;
                Ok(v)
            }
            Err(e) => {
                let _ = guard.borrow().execute_batch(&format!(
                    "ROLLBACK TO SAVEPOINT {sp_name}; RELEASE SAVEPOINT {sp_name};"
                ));
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Crud capture
    // -----------------------------------------------------------------------

    /// Finalize crud capture for the current write transaction: drop no-op
    /// PATCH entries and stamp everything captured so far with a fresh
    /// transaction id. Must run inside the surrounding `transaction()`.
    pub(crate) fn finish_crud_capture(&self) -> Result<bool> {
        let guard = self.conn.lock();
        let conn = guard.borrow();

        conn.execute(
            "DELETE FROM fp_crud
             WHERE tx_id IS NULL AND op = 'PATCH' AND (data IS NULL OR data = '{}')",
            [],
        )
        .map_err(storage_err)?;

        let pending: i64 = conn
            .query_row("SELECT COUNT(*) FROM fp_crud WHERE tx_id IS NULL", [], |r| r.get(0))
            .map_err(storage_err)?;
        if pending == 0 {
            return Ok(false);
        }

        let tx_id = {
            let current: Option<String> = conn
                .query_row(
                    "SELECT value FROM fp_meta WHERE key = 'crud_tx_counter'",
                    [],
                    |r| r.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            current.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0) + 1
        };
        conn.execute(
            "INSERT OR REPLACE INTO fp_meta (key, value) VALUES ('crud_tx_counter', ?1)",
            params![tx_id.to_string()],
        )
        .map_err(storage_err)?;
        conn.execute("UPDATE fp_crud SET tx_id = ?1 WHERE tx_id IS NULL", params![tx_id])
            .map_err(storage_err)?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Crud queue
    // -----------------------------------------------------------------------

    /// Oldest unconsumed transaction, or `None` when the queue is empty.
    pub(crate) fn next_crud_transaction(self: &Arc<Self>) -> Result<Option<CrudTransaction>> {
        self.check_open()?;
        let guard = self.conn.lock();
        let conn = guard.borrow();

        let tx_id: Option<i64> = conn
            .query_row(
                "SELECT MIN(tx_id) FROM fp_crud WHERE tx_id IS NOT NULL",
                [],
                |r| r.get(0),
            )
            .map_err(storage_err)?;
        let Some(tx_id) = tx_id else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare("SELECT seq, op, tbl, row_id, data FROM fp_crud WHERE tx_id = ?1 ORDER BY seq ASC")
            .map_err(storage_err)?;
        let mut rows = stmt.query(params![tx_id]).map_err(storage_err)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().map_err(storage_err)? {
            let seq: i64 = row.get(0).map_err(storage_err)?;
            let op_str: String = row.get(1).map_err(storage_err)?;
            let table: String = row.get(2).map_err(storage_err)?;
            let id: String = row.get(3).map_err(storage_err)?;
            let data_str: Option<String> = row.get(4).map_err(storage_err)?;

            let op = CrudOp::from_str(&op_str).ok_or_else(|| {
                FootprintDbError::Internal(format!("unknown crud op in queue: {op_str}"))
            })?;
            let data = data_str
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|e| FootprintDbError::Storage(StorageError::Serialization(e)))?;

            entries.push(CrudEntry { seq, tx_id, op, table, id, data });
        }

        Ok(Some(CrudTransaction {
            tx_id,
            entries,
            backend: Arc::clone(self),
        }))
    }

    /// Remove a completed (or fatally discarded) transaction from the queue.
    pub(crate) fn complete_crud_transaction(&self, tx_id: i64) -> Result<()> {
        let guard = self.conn.lock();
        guard
            .borrow()
            .execute("DELETE FROM fp_crud WHERE tx_id = ?1", params![tx_id])
            .map_err(storage_err)?;
        Ok(())
    }

    /// Number of unconsumed transactions in the queue.
    pub(crate) fn crud_transaction_count(&self) -> Result<usize> {
        self.check_open()?;
        let guard = self.conn.lock();
        let count: i64 = guard
            .borrow()
            .query_row(
                "SELECT COUNT(DISTINCT tx_id) FROM fp_crud WHERE tx_id IS NOT NULL",
                [],
                |r| r.get(0),
            )
            .map_err(storage_err)?;
        Ok(count as usize)
    }

    // -----------------------------------------------------------------------
    // Remote merge
    // -----------------------------------------------------------------------

    /// Apply authoritative remote changes with crud capture suppressed.
    ///
    /// Last write wins; unknown tables are skipped with a warning. Returns
    /// the number of changes applied.
    pub(crate) fn apply_remote_changes(&self, changes: &[RemoteChange]) -> Result<usize> {
        self.check_open()?;
        // Hold the connection lock across the capture toggle so no other
        // writer can slip a statement in while capture is off.
        let guard = self.conn.lock();
        self.capture_enabled.store(false, Ordering::SeqCst);
        let result = self.transaction(|b| {
            let mut applied = 0;
            for change in changes {
                let Some(table) = b.schema.table(&change.table).filter(|t| !t.local_only) else {
                    tracing::warn!(table = %change.table, "remote change for undeclared table skipped");
                    continue;
                };
                match change.op {
                    RemoteOp::Upsert => b.upsert_remote_row(table, change)?,
                    RemoteOp::Delete => {
                        b.execute_raw(
                            &format!("DELETE FROM {} WHERE id = ?1", quote_ident(&table.name)),
                            &[Value::String(change.id.clone())],
                        )?;
                    }
                }
                applied += 1;
            }
            Ok(applied)
        });
        self.capture_enabled.store(true, Ordering::SeqCst);
        drop(guard);
        result
    }

    fn upsert_remote_row(&self, table: &Table, change: &RemoteChange) -> Result<()> {
        let empty = Value::Object(serde_json::Map::new());
        let data = change.data.as_ref().unwrap_or(&empty);

        let mut params: Vec<Value> = vec![Value::String(change.id.clone())];
        for col in &table.columns {
            params.push(data.get(&col.name).cloned().unwrap_or(Value::Null));
        }

        let sql = if table.columns.is_empty() {
            format!(
                "INSERT INTO {} (id) VALUES (?1) ON CONFLICT(id) DO NOTHING",
                quote_ident(&table.name)
            )
        } else {
            let col_list: Vec<String> =
                table.columns.iter().map(|c| quote_ident(&c.name)).collect();
            let placeholders: Vec<String> =
                (2..=table.columns.len() + 1).map(|i| format!("?{i}")).collect();
            let updates: Vec<String> = table
                .columns
                .iter()
                .map(|c| format!("{0} = excluded.{0}", quote_ident(&c.name)))
                .collect();
            format!(
                "INSERT INTO {} (id, {}) VALUES (?1, {}) ON CONFLICT(id) DO UPDATE SET {}",
                quote_ident(&table.name),
                col_list.join(", "),
                placeholders.join(", "),
                updates.join(", ")
            )
        };
        self.execute_raw(&sql, &params)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Metadata / change tracking
    // -----------------------------------------------------------------------

    pub(crate) fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let guard = self.conn.lock();
        let conn = guard.borrow();
        conn.query_row("SELECT value FROM fp_meta WHERE key = ?1", params![key], |r| {
            r.get::<_, String>(0)
        })
        .optional()
        .map_err(storage_err)
    }

    pub(crate) fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let guard = self.conn.lock();
        guard
            .borrow()
            .execute(
                "INSERT OR REPLACE INTO fp_meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    /// Drain the set of tables written since the last call.
    pub(crate) fn take_changed_tables(&self) -> HashSet<String> {
        std::mem::take(&mut *self.changed_tables.lock())
    }

    pub(crate) fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Wipe user tables, the crud queue, attachment records and metadata.
    /// Used by sign-out: the database stays usable but holds no data.
    pub(crate) fn clear_all(&self) -> Result<()> {
        self.check_open()?;
        let guard = self.conn.lock();
        self.capture_enabled.store(false, Ordering::SeqCst);
        let result = self.transaction(|b| {
            for table in &b.schema.tables {
                b.execute_raw(&format!("DELETE FROM {}", quote_ident(&table.name)), &[])?;
            }
            b.execute_raw("DELETE FROM fp_crud", &[])?;
            b.execute_raw("DELETE FROM fp_attachments", &[])?;
            b.execute_raw("DELETE FROM fp_meta", &[])?;
            Ok(())
        });
        self.capture_enabled.store(true, Ordering::SeqCst);
        drop(guard);
        result
    }
}

// ============================================================================
// Tests
// ============================================================================
