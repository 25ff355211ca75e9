//! Shared data types crossing component boundaries: credentials, sessions,
//! and the remote-change model applied by the sync client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Session / Credentials
// ---------------------------------------------------------------------------

/// An authenticated (or anonymous) session as reported by the application's
/// auth provider.
///
/// `user_id == None` is first-class: the engine runs in local-only mode,
/// rows carry a null owner and nothing is uploaded until a session exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: Option<String>,
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Short-lived credentials for the sync service connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub endpoint: String,
    pub token: String,
    pub user_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Whether the token has passed its expiry timestamp.
    ///
    /// Credentials without an expiry never expire from the engine's point of
    /// view; the backend will reject them and trigger a refresh instead.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Utc::now() >= at,
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Remote changes
// ---------------------------------------------------------------------------

/// Operation carried by a remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteOp {
    /// Insert-or-replace the row (last write wins).
    Upsert,
    /// Remove the row (remote tombstone).
    Delete,
}

/// One authoritative row change received from the sync service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteChange {
    pub table: String,
    pub id: String,
    pub op: RemoteOp,
    /// Full row payload for `Upsert`; ignored for `Delete`.
    pub data: Option<Value>,
}

/// A batch of remote changes plus the cursor to resume from.
#[derive(Debug, Clone, Default)]
pub struct RemoteBatch {
    pub changes: Vec<RemoteChange>,
    /// Durable cursor; persisted after the batch is applied.
    pub checkpoint: i64,
    /// True when the service has more changes immediately available —
    /// the client pulls again without sleeping and without marking the
    /// checkpoint as a completed sync.
    pub has_more: bool,
}
