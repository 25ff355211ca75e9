use thiserror::Error;

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Table \"{0}\" is not declared in the schema.")]
    UnknownTable(String),

    #[error("Database is closed.")]
    Closed,

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// ConnectorError
// ---------------------------------------------------------------------------

/// Failures of the credential side of a [`crate::connector::Connector`].
///
/// `NoSession` is deliberately not a hard failure for the engine: the
/// uploader and sync client treat it as transient and keep waiting.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("No session available")]
    NoSession,

    #[error("Failed to fetch credentials: {0}")]
    Credentials(String),
}

// ---------------------------------------------------------------------------
// SyncError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Sync client disposed")]
    Disposed,

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ---------------------------------------------------------------------------
// AttachmentError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Attachment not found: {0}")]
    NotFound(String),

    #[error("Local storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote storage error: {message}")]
    Remote { message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AttachmentError {
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// FootprintDbError — top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FootprintDbError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Attachment(#[from] AttachmentError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for FootprintDbError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Sqlite(e))
    }
}

/// Convenience alias — the default error type is `FootprintDbError`.
pub type Result<T, E = FootprintDbError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_unknown_table_display() {
        let e = StorageError::UnknownTable("sightings".to_string());
        let msg = e.to_string();
        assert!(msg.contains("sightings"), "table name missing: {msg}");
        assert!(msg.contains("schema"), "missing 'schema': {msg}");
    }

    #[test]
    fn storage_error_transaction_with_source() {
        let inner: Box<dyn std::error::Error + Send + Sync> = "db locked".into();
        let e = StorageError::Transaction {
            message: "commit failed".to_string(),
            source: Some(inner),
        };
        let msg = e.to_string();
        assert!(msg.contains("Transaction error"), "prefix missing: {msg}");
        assert!(msg.contains("commit failed"), "message missing: {msg}");
    }

    #[test]
    fn connector_error_no_session_display() {
        assert_eq!(ConnectorError::NoSession.to_string(), "No session available");
    }

    #[test]
    fn attachment_error_remote_display() {
        let e = AttachmentError::remote("HTTP 503");
        let msg = e.to_string();
        assert!(msg.contains("HTTP 503"), "message missing: {msg}");
    }

    #[test]
    fn rollup_from_storage_error() {
        let e: FootprintDbError = StorageError::Closed.into();
        assert!(matches!(e, FootprintDbError::Storage(_)));
    }

    #[test]
    fn rollup_from_connector_error() {
        let e: FootprintDbError = ConnectorError::NoSession.into();
        assert!(matches!(e, FootprintDbError::Connector(_)));
    }

    #[test]
    fn rollup_from_sync_error() {
        let e: FootprintDbError = SyncError::Disposed.into();
        assert!(matches!(e, FootprintDbError::Sync(_)));
    }

    #[test]
    fn rollup_from_rusqlite_error() {
        let e: FootprintDbError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(
            e,
            FootprintDbError::Storage(StorageError::Sqlite(_))
        ));
    }
}
