//! The Local Durable Store.
//!
//! [`Database`] wraps the SQLite backend with crud capture, change
//! notification and live queries. It is cheap to clone (all state is behind
//! `Arc`s) and `Send + Sync`; the uploader, sync client and attachment
//! engine each hold a clone.
//!
//! # Write path
//!
//! Every write goes through [`Database::execute`] or
//! [`Database::write_transaction`]: statements run inside a SQLite
//! savepoint, capture triggers append to the mutation queue, and on commit
//! the captured entries are stamped with one transaction id and a single
//! [`ChangeEvent`] is emitted. A failed statement rolls back both the data
//! and its capture rows, so nothing half-written ever reaches the queue.

pub mod crud;
pub mod sqlite;
pub mod watch;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::schema::Schema;
use crate::types::RemoteChange;

pub use crud::{CrudEntry, CrudOp, CrudTransaction};
pub use watch::{ChangeEvent, WatchHandle, WatchOptions};

use sqlite::SqliteBackend;
use watch::EventEmitter;

// ============================================================================
// WriteTransaction
// ============================================================================

/// Handle passed to [`Database::write_transaction`] closures.
///
/// All statements executed through it commit (and stamp one crud
/// transaction) atomically with the closure.
pub struct WriteTransaction<'a> {
    backend: &'a SqliteBackend,
}

impl WriteTransaction<'_> {
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.backend.execute_raw(sql, params)
    }

    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>> {
        self.backend.query_raw(sql, params)
    }
}

// ============================================================================
// Database
// ============================================================================

/// The durable store shared by all engine components.
#[derive(Clone)]
pub struct Database {
    backend: Arc<SqliteBackend>,
    emitter: Arc<EventEmitter<ChangeEvent>>,
}

impl Database {
    /// Open a file-backed database, creating tables and triggers for
    /// `schema` as needed.
    pub fn open(path: &str, schema: Schema) -> Result<Self> {
        Ok(Self {
            backend: Arc::new(SqliteBackend::open(path, schema)?),
            emitter: Arc::new(EventEmitter::new()),
        })
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory(schema: Schema) -> Result<Self> {
        Ok(Self {
            backend: Arc::new(SqliteBackend::open_in_memory(schema)?),
            emitter: Arc::new(EventEmitter::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Apply a single statement transactionally.
    ///
    /// Writes against synced tables are recorded in the mutation queue as
    /// one crud transaction. Constraint violations fail here synchronously
    /// and leave the queue untouched.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.write_transaction(|tx| tx.execute(sql, params))
    }

    /// Run several statements as one transaction → one crud transaction.
    ///
    /// This is the atomicity primitive `save_file`/`delete_file` build on:
    /// the closure either commits completely (data plus capture rows) or
    /// not at all.
    pub fn write_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&WriteTransaction<'_>) -> Result<T>,
    {
        self.backend.check_open()?;
        let result = self.backend.transaction(|b| {
            let wtx = WriteTransaction { backend: b };
            let out = f(&wtx)?;
            b.finish_crud_capture()?;
            Ok(out)
        });
        match result {
            Ok(v) => {
                self.emit_changes();
                Ok(v)
            }
            Err(e) => {
                // Rolled back — drop the change-tracking noise as well.
                let _ = self.backend.take_changed_tables();
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Run a query, returning each row as a JSON object keyed by column name.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>> {
        self.backend.query_raw(sql, params)
    }

    /// Run a query and return the first row, if any.
    pub fn get(&self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        Ok(self.backend.query_raw(sql, params)?.into_iter().next())
    }

    // -----------------------------------------------------------------------
    // Live queries
    // -----------------------------------------------------------------------

    /// Register a live query.
    ///
    /// The callback fires once immediately with the current result set, and
    /// again after every committed transaction (local write or remote merge)
    /// that touched the query's tables, until the returned handle is
    /// unsubscribed or dropped. Query failures on re-run are logged and
    /// skipped — the subscription stays alive.
    pub fn watch(
        &self,
        sql: &str,
        params: &[Value],
        options: WatchOptions,
        callback: impl Fn(&[Value]) + Send + Sync + 'static,
    ) -> Result<WatchHandle> {
        let rows = self.query(sql, params)?;
        callback(&rows);

        let active = Arc::new(AtomicBool::new(true));
        let backend = Arc::clone(&self.backend);
        let sql = sql.to_string();
        let params = params.to_vec();
        let active_cb = Arc::clone(&active);

        let id = self.emitter.on(move |event| {
            if !active_cb.load(Ordering::SeqCst) || !options.matches(event) {
                return;
            }
            match backend.query_raw(&sql, &params) {
                Ok(rows) => {
                    // Re-check: unsubscribe may have raced the query.
                    if active_cb.load(Ordering::SeqCst) {
                        callback(&rows);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "watch query failed"),
            }
        });
        Ok(WatchHandle::new(id, Arc::clone(&self.emitter), active))
    }

    /// Subscribe to raw change events (internal tables included).
    pub(crate) fn subscribe_changes(
        &self,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> WatchHandle {
        let active = Arc::new(AtomicBool::new(true));
        let active_cb = Arc::clone(&active);
        let id = self.emitter.on(move |event| {
            if active_cb.load(Ordering::SeqCst) {
                callback(event);
            }
        });
        WatchHandle::new(id, Arc::clone(&self.emitter), active)
    }

    // -----------------------------------------------------------------------
    // Crud queue
    // -----------------------------------------------------------------------

    /// Pop the oldest unconsumed crud transaction without removing it.
    ///
    /// At-least-once handoff: the transaction stays queued until
    /// [`CrudTransaction::complete`] is called on it.
    pub fn next_crud_transaction(&self) -> Result<Option<CrudTransaction>> {
        self.backend.next_crud_transaction()
    }

    /// Number of unconsumed crud transactions (diagnostics surface).
    pub fn crud_transaction_count(&self) -> Result<usize> {
        self.backend.crud_transaction_count()
    }

    // -----------------------------------------------------------------------
    // Remote merge
    // -----------------------------------------------------------------------

    /// Merge authoritative server-side changes into the store.
    ///
    /// Bypasses the mutation queue entirely — remote-origin writes must not
    /// echo back to the server. Watchers are notified like for local writes.
    pub fn apply_remote_changes(&self, changes: &[RemoteChange]) -> Result<usize> {
        let applied = self.backend.apply_remote_changes(changes)?;
        self.emit_changes();
        Ok(applied)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Wipe all user data, the mutation queue and attachment records.
    ///
    /// Used on sign-out. The database stays open and usable afterwards.
    pub fn disconnect_and_clear(&self) -> Result<()> {
        self.backend.clear_all()?;
        self.emit_changes();
        Ok(())
    }

    /// Close the store: no further statements are accepted and all watch
    /// listeners are dropped. Queued-but-unsent mutations stay on disk and
    /// are picked up on the next open.
    pub fn close(&self) {
        self.backend.mark_closed();
        self.emitter.clear();
    }

    pub fn schema(&self) -> &Schema {
        self.backend.schema()
    }

    pub(crate) fn backend(&self) -> &Arc<SqliteBackend> {
        &self.backend
    }

    pub(crate) fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.backend.get_meta(key)
    }

    pub(crate) fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.backend.set_meta(key, value)
    }

    fn emit_changes(&self) {
        let tables = self.backend.take_changed_tables();
        if !tables.is_empty() {
            self.emitter.emit(&ChangeEvent::new(tables));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
