//! Attachment records — the `fp_attachments` table and its state machine.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::db::{Database, WriteTransaction};
use crate::error::{FootprintDbError, Result};

// ============================================================================
// AttachmentState
// ============================================================================

/// Lifecycle state of a tracked attachment.
///
/// Transitions are driven by reconciliation: watched-but-absent ids queue a
/// download, locally present but unconfirmed bytes queue an upload,
/// unreferenced entries are archived (bytes retained) and eventually
/// evicted, and explicit deletes queue asynchronous byte removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    QueuedUpload,
    QueuedDownload,
    Synced,
    Archived,
    QueuedDelete,
}

impl AttachmentState {
    pub(crate) fn as_i64(self) -> i64 {
        match self {
            AttachmentState::QueuedUpload => 0,
            AttachmentState::QueuedDownload => 1,
            AttachmentState::Synced => 2,
            AttachmentState::Archived => 3,
            AttachmentState::QueuedDelete => 4,
        }
    }

    pub(crate) fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(AttachmentState::QueuedUpload),
            1 => Some(AttachmentState::QueuedDownload),
            2 => Some(AttachmentState::Synced),
            3 => Some(AttachmentState::Archived),
            4 => Some(AttachmentState::QueuedDelete),
            _ => None,
        }
    }
}

// ============================================================================
// AttachmentRecord
// ============================================================================

/// One tracked attachment.
#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub id: String,
    /// Key in remote storage; also the basename of the local copy.
    pub filename: String,
    pub media_type: Option<String>,
    pub state: AttachmentState,
    /// Whether the bytes are present in local storage.
    pub has_local: bool,
    /// Last state-transition time; archival eviction is oldest-first on
    /// this column.
    pub updated_at: DateTime<Utc>,
}

impl AttachmentRecord {
    fn from_row(row: &Value) -> Result<Self> {
        let state_i = row["state"].as_i64().unwrap_or(-1);
        let state = AttachmentState::from_i64(state_i).ok_or_else(|| {
            FootprintDbError::Internal(format!("invalid attachment state {state_i}"))
        })?;
        let updated_at = row["updated_at"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Ok(Self {
            id: row["id"].as_str().unwrap_or_default().to_string(),
            filename: row["filename"].as_str().unwrap_or_default().to_string(),
            media_type: row["media_type"].as_str().map(str::to_string),
            state,
            has_local: row["has_local"].as_i64().unwrap_or(0) != 0,
            updated_at,
        })
    }
}

// ============================================================================
// Table access
// ============================================================================

const UPSERT_SQL: &str = "INSERT OR REPLACE INTO fp_attachments \
     (id, filename, media_type, state, has_local, updated_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

fn upsert_params(record: &AttachmentRecord) -> Vec<Value> {
    vec![
        json!(record.id),
        json!(record.filename),
        record.media_type.as_deref().map(Value::from).unwrap_or(Value::Null),
        json!(record.state.as_i64()),
        json!(if record.has_local { 1 } else { 0 }),
        json!(record.updated_at.to_rfc3339()),
    ]
}

/// Insert-or-replace within an open write transaction (used by `save_file`
/// so the record commits atomically with the caller's referencing row).
pub(crate) fn upsert_in_tx(tx: &WriteTransaction<'_>, record: &AttachmentRecord) -> Result<()> {
    tx.execute(UPSERT_SQL, &upsert_params(record))?;
    Ok(())
}

pub(crate) fn upsert(db: &Database, record: &AttachmentRecord) -> Result<()> {
    db.execute(UPSERT_SQL, &upsert_params(record))?;
    Ok(())
}

pub(crate) fn get(db: &Database, id: &str) -> Result<Option<AttachmentRecord>> {
    db.get("SELECT * FROM fp_attachments WHERE id = ?1", &[json!(id)])?
        .as_ref()
        .map(AttachmentRecord::from_row)
        .transpose()
}

/// All records, oldest `updated_at` first.
pub(crate) fn all(db: &Database) -> Result<Vec<AttachmentRecord>> {
    db.query("SELECT * FROM fp_attachments ORDER BY updated_at ASC, id ASC", &[])?
        .iter()
        .map(AttachmentRecord::from_row)
        .collect()
}

pub(crate) fn set_state(db: &Database, id: &str, state: AttachmentState) -> Result<()> {
    db.execute(
        "UPDATE fp_attachments SET state = ?1, updated_at = ?2 WHERE id = ?3",
        &[json!(state.as_i64()), json!(Utc::now().to_rfc3339()), json!(id)],
    )?;
    Ok(())
}

pub(crate) fn set_state_in_tx(
    tx: &WriteTransaction<'_>,
    id: &str,
    state: AttachmentState,
) -> Result<usize> {
    Ok(tx.execute(
        "UPDATE fp_attachments SET state = ?1, updated_at = ?2 WHERE id = ?3",
        &[json!(state.as_i64()), json!(Utc::now().to_rfc3339()), json!(id)],
    )?)
}

pub(crate) fn set_synced(db: &Database, id: &str, has_local: bool) -> Result<()> {
    db.execute(
        "UPDATE fp_attachments SET state = ?1, has_local = ?2, updated_at = ?3 WHERE id = ?4",
        &[
            json!(AttachmentState::Synced.as_i64()),
            json!(if has_local { 1 } else { 0 }),
            json!(Utc::now().to_rfc3339()),
            json!(id),
        ],
    )?;
    Ok(())
}

pub(crate) fn remove(db: &Database, id: &str) -> Result<()> {
    db.execute("DELETE FROM fp_attachments WHERE id = ?1", &[json!(id)])?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    fn db() -> Database {
        Database::open_in_memory(Schema::default()).unwrap()
    }

    fn record(id: &str, state: AttachmentState) -> AttachmentRecord {
        AttachmentRecord {
            id: id.to_string(),
            filename: format!("{id}.jpeg"),
            media_type: Some("image/jpeg".to_string()),
            state,
            has_local: false,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn state_round_trips_through_i64() {
        for state in [
            AttachmentState::QueuedUpload,
            AttachmentState::QueuedDownload,
            AttachmentState::Synced,
            AttachmentState::Archived,
            AttachmentState::QueuedDelete,
        ] {
            assert_eq!(AttachmentState::from_i64(state.as_i64()), Some(state));
        }
        assert_eq!(AttachmentState::from_i64(99), None);
    }

    #[test]
    fn upsert_and_get_round_trip() {
        let db = db();
        let r = record("p1", AttachmentState::QueuedUpload);
        upsert(&db, &r).unwrap();

        let loaded = get(&db, "p1").unwrap().unwrap();
        assert_eq!(loaded.id, "p1");
        assert_eq!(loaded.filename, "p1.jpeg");
        assert_eq!(loaded.media_type.as_deref(), Some("image/jpeg"));
        assert_eq!(loaded.state, AttachmentState::QueuedUpload);
        assert!(!loaded.has_local);
    }

    #[test]
    fn set_state_updates_timestamp() {
        let db = db();
        let mut r = record("p1", AttachmentState::QueuedUpload);
        r.updated_at = Utc::now() - chrono::Duration::hours(1);
        upsert(&db, &r).unwrap();

        set_state(&db, "p1", AttachmentState::Archived).unwrap();
        let loaded = get(&db, "p1").unwrap().unwrap();
        assert_eq!(loaded.state, AttachmentState::Archived);
        assert!(loaded.updated_at > r.updated_at);
    }

    #[test]
    fn all_orders_by_updated_at_ascending() {
        let db = db();
        let mut older = record("old", AttachmentState::Archived);
        older.updated_at = Utc::now() - chrono::Duration::hours(2);
        let newer = record("new", AttachmentState::Archived);
        upsert(&db, &newer).unwrap();
        upsert(&db, &older).unwrap();

        let ids: Vec<String> = all(&db).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["old", "new"]);
    }

    #[test]
    fn remove_deletes_the_row() {
        let db = db();
        upsert(&db, &record("p1", AttachmentState::Synced)).unwrap();
        remove(&db, "p1").unwrap();
        assert!(get(&db, "p1").unwrap().is_none());
    }
}
