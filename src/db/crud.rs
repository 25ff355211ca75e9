//! The durable mutation queue ("crud queue").
//!
//! Every local write against a synced table is recorded as a [`CrudEntry`];
//! entries committed together share a transaction id and are handed to the
//! uploader as one [`CrudTransaction`]. Handoff is at-least-once: fetching a
//! transaction does not remove it — only [`CrudTransaction::complete`] does,
//! so queued work survives crashes and restarts.

use std::sync::Arc;

use serde_json::Value;

use crate::db::sqlite::SqliteBackend;
use crate::error::Result;

// ============================================================================
// CrudOp
// ============================================================================

/// The kind of a recorded local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrudOp {
    /// Full row write — maps to upsert-by-id on the backend.
    Put,
    /// Partial update — `data` holds only the changed columns.
    Patch,
    /// Row deletion — no payload.
    Delete,
}

impl CrudOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CrudOp::Put => "PUT",
            CrudOp::Patch => "PATCH",
            CrudOp::Delete => "DELETE",
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<Self> {
        match s {
            "PUT" => Some(CrudOp::Put),
            "PATCH" => Some(CrudOp::Patch),
            "DELETE" => Some(CrudOp::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for CrudOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CrudEntry
// ============================================================================

/// One recorded local mutation, ordered by `seq` within its transaction.
#[derive(Debug, Clone)]
pub struct CrudEntry {
    /// Global sequence number (monotonic across all transactions).
    pub seq: i64,
    /// Transaction the entry belongs to.
    pub tx_id: i64,
    pub op: CrudOp,
    pub table: String,
    /// The target row's client-generated id.
    pub id: String,
    /// Full row for `Put`, changed columns for `Patch`, `None` for `Delete`.
    pub data: Option<Value>,
}

// ============================================================================
// CrudTransaction
// ============================================================================

/// An ordered batch of mutations handed to the uploader as a unit.
///
/// The transaction stays in the queue until [`complete`](Self::complete) is
/// called; re-fetching before that yields the same transaction again.
pub struct CrudTransaction {
    pub tx_id: i64,
    pub entries: Vec<CrudEntry>,
    pub(crate) backend: Arc<SqliteBackend>,
}

impl CrudTransaction {
    /// Durably remove this transaction from the queue.
    ///
    /// Called after the backend confirmed every mutation, or after the
    /// transaction was classified fatally failed and discarded.
    pub fn complete(self) -> Result<()> {
        self.backend.complete_crud_transaction(self.tx_id)
    }
}

impl std::fmt::Debug for CrudTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrudTransaction")
            .field("tx_id", &self.tx_id)
            .field("entries", &self.entries)
            .finish()
    }
}
