//! REST connector — PostgREST-style backend adapter.
//!
//! Maps crud entries onto `/rest/v1/{table}` calls: PUT becomes an upsert
//! (`on_conflict=id` with merge-duplicates preference), PATCH a partial
//! update filtered by id, DELETE a delete filtered by id. All three are
//! idempotent under re-delivery. Credentials come from a [`SessionProvider`]
//! so the connector itself stays free of auth-provider specifics.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::db::crud::{CrudEntry, CrudOp};
use crate::error::ConnectorError;
use crate::types::{Credentials, Session};

use super::{BackendError, Connector, FatalCodeMatcher};

// ============================================================================
// SessionProvider
// ============================================================================

/// Source of the current auth session.
///
/// Implemented by the application's auth integration; `None` means
/// local-only mode (valid, not an error).
pub trait SessionProvider: Send + Sync {
    fn session(&self) -> Option<Session>;
}

/// A `SessionProvider` holding an explicitly managed session. Useful for
/// tests and for applications that push session updates from an auth-state
/// listener.
#[derive(Default)]
pub struct StaticSessionProvider {
    inner: Mutex<Option<Session>>,
}

impl StaticSessionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            inner: Mutex::new(Some(session)),
        }
    }

    pub fn set_session(&self, session: Option<Session>) {
        *self.inner.lock() = session;
    }
}

impl SessionProvider for StaticSessionProvider {
    fn session(&self) -> Option<Session> {
        self.inner.lock().clone()
    }
}

// ============================================================================
// RestConnector
// ============================================================================

/// Connector for PostgREST-compatible backends (e.g. Supabase).
pub struct RestConnector {
    http: reqwest::Client,
    /// Base URL of the REST API, without the `/rest/v1` suffix.
    base_url: String,
    /// Endpoint handed out with credentials for the sync-service connection.
    sync_endpoint: String,
    /// Extra project API key header, when the backend requires one.
    api_key: Option<String>,
    /// Column patched with the session's user id at upload time. `None`
    /// disables owner injection.
    owner_column: Option<String>,
    session: Arc<dyn SessionProvider>,
    fatal_codes: FatalCodeMatcher,
}

impl RestConnector {
    pub fn new(
        base_url: impl Into<String>,
        sync_endpoint: impl Into<String>,
        session: Arc<dyn SessionProvider>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            sync_endpoint: sync_endpoint.into(),
            api_key: None,
            owner_column: None,
            session,
            fatal_codes: FatalCodeMatcher::postgres(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_owner_column(mut self, column: impl Into<String>) -> Self {
        self.owner_column = Some(column.into());
        self
    }

    pub fn with_fatal_codes(mut self, matcher: FatalCodeMatcher) -> Self {
        self.fatal_codes = matcher;
        self
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url.trim_end_matches('/'))
    }

    fn authed(&self, req: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        let req = req.bearer_auth(token);
        match &self.api_key {
            Some(key) => req.header("apikey", key),
            None => req,
        }
    }

    /// Turn an error response body into a `BackendError`, extracting the
    /// backend's `code` field when present.
    async fn response_error(response: reqwest::Response) -> BackendError {
        let status = response.status().as_u16();
        match response.json::<Value>().await {
            Ok(body) => {
                let message = body
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("backend request failed")
                    .to_string();
                match body.get("code").and_then(Value::as_str) {
                    Some(code) => BackendError::with_code(message, code, Some(status)),
                    None => BackendError {
                        message,
                        code: None,
                        status: Some(status),
                    },
                }
            }
            Err(_) => BackendError {
                message: format!("backend request failed with HTTP {status}"),
                code: None,
                status: Some(status),
            },
        }
    }
}

#[async_trait]
impl Connector for RestConnector {
    async fn fetch_credentials(&self) -> Result<Credentials, ConnectorError> {
        let session = self.session.session().ok_or(ConnectorError::NoSession)?;
        Ok(Credentials {
            endpoint: self.sync_endpoint.clone(),
            token: session.access_token,
            user_id: session.user_id,
            expires_at: session.expires_at,
        })
    }

    async fn apply_crud(&self, entry: &CrudEntry) -> Result<(), BackendError> {
        // No token yet means the row cannot be uploaded; report transient so
        // the transaction stays queued until a session exists.
        let session = self
            .session
            .session()
            .ok_or_else(|| BackendError::network("no session available for upload"))?;
        let url = self.table_url(&entry.table);

        let request = match entry.op {
            CrudOp::Put => {
                let mut record = match &entry.data {
                    Some(Value::Object(map)) => map.clone(),
                    _ => serde_json::Map::new(),
                };
                record.insert("id".to_string(), Value::String(entry.id.clone()));
                self.authed(self.http.post(&url), &session.access_token)
                    .query(&[("on_conflict", "id")])
                    .header("Prefer", "resolution=merge-duplicates")
                    .json(&Value::Object(record))
            }
            CrudOp::Patch => {
                let data = entry.data.clone().unwrap_or(Value::Object(Default::default()));
                self.authed(self.http.patch(&url), &session.access_token)
                    .query(&[("id", format!("eq.{}", entry.id))])
                    .json(&data)
            }
            CrudOp::Delete => self
                .authed(self.http.delete(&url), &session.access_token)
                .query(&[("id", format!("eq.{}", entry.id))]),
        };

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::network(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::response_error(response).await)
        }
    }

    fn is_fatal(&self, error: &BackendError) -> bool {
        match &error.code {
            Some(code) => self.fatal_codes.matches(code),
            None => false,
        }
    }

    fn prepare_upload(&self, mut entry: CrudEntry) -> CrudEntry {
        // Rows created in local-only mode carry a null owner; stamp the
        // now-known user id at upload time only.
        let Some(owner_column) = &self.owner_column else {
            return entry;
        };
        let Some(user_id) = self.user_id() else {
            return entry;
        };
        if entry.op == CrudOp::Put {
            if let Some(Value::Object(map)) = &mut entry.data {
                let missing = matches!(map.get(owner_column), None | Some(Value::Null));
                if missing {
                    map.insert(owner_column.clone(), Value::String(user_id));
                }
            }
        }
        entry
    }

    fn user_id(&self) -> Option<String> {
        self.session.session().and_then(|s| s.user_id)
    }
}

// ============================================================================
// Tests
// ============================================================================
