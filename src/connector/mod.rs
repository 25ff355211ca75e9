//! Backend connector — the capability interface between the engine and a
//! concrete remote backend.
//!
//! The engine owns the upload protocol (ordering, retry, fatal triage); a
//! [`Connector`] contributes the backend-specific pieces: credentials for
//! the sync connection, the mapping of PUT/PATCH/DELETE onto backend
//! primitives, the fatal-error predicate, and an optional upload-time
//! rewrite of outgoing entries. PUT must map onto upsert-by-id so that
//! re-delivery after a partial failure does not create duplicates.

pub mod rest;

use async_trait::async_trait;
use regex::Regex;

use crate::db::crud::CrudEntry;
use crate::error::ConnectorError;
use crate::types::Credentials;

pub use rest::{RestConnector, SessionProvider, StaticSessionProvider};

// ============================================================================
// BackendError
// ============================================================================

/// An error reported by the remote backend while applying a mutation.
///
/// `code` carries the backend's machine-readable error code when one was
/// returned (e.g. a Postgres SQLSTATE); classification into transient vs
/// fatal happens through [`Connector::is_fatal`], never by the engine.
#[derive(Debug, Clone)]
pub struct BackendError {
    pub message: String,
    pub code: Option<String>,
    pub status: Option<u16>,
}

impl BackendError {
    /// A transport-level failure with no backend error code (network down,
    /// DNS, timeouts). Always classified transient.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status: None,
        }
    }

    pub fn with_code(
        message: impl Into<String>,
        code: impl Into<String>,
        status: Option<u16>,
    ) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
            status,
        }
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for BackendError {}

// ============================================================================
// FatalCodeMatcher
// ============================================================================

/// Pluggable predicate over backend error codes.
///
/// Connectors hold one of these instead of the engine hardcoding a backend's
/// code taxonomy.
#[derive(Debug, Clone)]
pub struct FatalCodeMatcher {
    patterns: Vec<Regex>,
}

impl FatalCodeMatcher {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }

    /// Postgres response codes that cannot be recovered from by retrying:
    /// class 22 (data exception), class 23 (integrity constraint violation)
    /// and 42501 (insufficient privilege, typically a row-level security
    /// rejection).
    pub fn postgres() -> Self {
        let patterns = ["^22...$", "^23...$", "^42501$"]
            .iter()
            .map(|p| Regex::new(p).expect("static pattern"))
            .collect();
        Self { patterns }
    }

    pub fn matches(&self, code: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(code))
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Backend adapter consumed by the uploader and the sync client.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Short-lived credentials for the sync-service connection.
    ///
    /// Fails with [`ConnectorError::NoSession`] when no session exists; the
    /// engine treats that as transient and keeps waiting.
    async fn fetch_credentials(&self) -> Result<Credentials, ConnectorError>;

    /// Apply a single mutation to the backend.
    async fn apply_crud(&self, entry: &CrudEntry) -> Result<(), BackendError>;

    /// Whether `error` is non-retryable. Defaults to retrying everything.
    fn is_fatal(&self, _error: &BackendError) -> bool {
        false
    }

    /// Rewrite an entry immediately before upload (e.g. stamp the owner id
    /// on rows created while offline). Never mutates the local row.
    fn prepare_upload(&self, entry: CrudEntry) -> CrudEntry {
        entry
    }

    /// The current session's user id, if any.
    fn user_id(&self) -> Option<String> {
        None
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_matcher_flags_constraint_violations() {
        let m = FatalCodeMatcher::postgres();
        assert!(m.matches("23505")); // unique violation
        assert!(m.matches("23503")); // foreign key violation
        assert!(m.matches("22P02")); // invalid text representation
        assert!(m.matches("42501")); // insufficient privilege
    }

    #[test]
    fn postgres_matcher_ignores_transient_codes() {
        let m = FatalCodeMatcher::postgres();
        assert!(!m.matches("08006")); // connection failure
        assert!(!m.matches("57014")); // query canceled
        assert!(!m.matches("42P01")); // undefined table — not in the 42501 set
        assert!(!m.matches(""));
    }

    #[test]
    fn backend_error_display_includes_code() {
        let e = BackendError::with_code("duplicate key", "23505", Some(409));
        assert_eq!(e.to_string(), "duplicate key (code 23505)");
        let e = BackendError::network("connection refused");
        assert_eq!(e.to_string(), "connection refused");
    }
}
