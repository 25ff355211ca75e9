//! Remote byte storage for attachments.
//!
//! Filename-keyed. Adapters must tolerate "already exists" on upload and
//! "not found" on delete as non-errors so reconciliation retries stay
//! idempotent.

use std::sync::Arc;

use async_trait::async_trait;

use crate::connector::SessionProvider;
use crate::error::AttachmentError;

// ============================================================================
// RemoteStorageAdapter
// ============================================================================

#[async_trait]
pub trait RemoteStorageAdapter: Send + Sync {
    /// Upload `data` under `filename`, replacing an existing object.
    async fn upload_file(
        &self,
        filename: &str,
        data: &[u8],
        media_type: Option<&str>,
    ) -> Result<(), AttachmentError>;

    /// Download the object stored under `filename`. Missing objects are
    /// [`AttachmentError::NotFound`].
    async fn download_file(&self, filename: &str) -> Result<Vec<u8>, AttachmentError>;

    /// Delete the object stored under `filename`. Missing objects are fine.
    async fn delete_file(&self, filename: &str) -> Result<(), AttachmentError>;
}

// ============================================================================
// HttpRemoteStorage
// ============================================================================

/// Bucket-style object storage over HTTP (e.g. Supabase Storage).
///
/// Objects live at `{base_url}/storage/v1/object/{bucket}/{filename}`;
/// requests carry the current session's bearer token. A missing session
/// fails as a retryable remote error — the attachment stays queued until
/// sign-in.
pub struct HttpRemoteStorage {
    http: reqwest::Client,
    base_url: String,
    bucket: String,
    api_key: Option<String>,
    session: Arc<dyn SessionProvider>,
}

impl HttpRemoteStorage {
    pub fn new(
        base_url: impl Into<String>,
        bucket: impl Into<String>,
        session: Arc<dyn SessionProvider>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            bucket: bucket.into(),
            api_key: None,
            session,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn object_url(&self, filename: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{filename}",
            self.base_url.trim_end_matches('/'),
            self.bucket
        )
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, AttachmentError> {
        let session = self
            .session
            .session()
            .ok_or_else(|| AttachmentError::remote("no session available for remote storage"))?;
        let req = req.bearer_auth(session.access_token);
        Ok(match &self.api_key {
            Some(key) => req.header("apikey", key),
            None => req,
        })
    }
}

#[async_trait]
impl RemoteStorageAdapter for HttpRemoteStorage {
    async fn upload_file(
        &self,
        filename: &str,
        data: &[u8],
        media_type: Option<&str>,
    ) -> Result<(), AttachmentError> {
        let mut req = self
            .authed(self.http.post(self.object_url(filename)))?
            .header("x-upsert", "true")
            .body(data.to_vec());
        if let Some(mt) = media_type {
            req = req.header("content-type", mt.to_string());
        }
        let response = req
            .send()
            .await
            .map_err(|e| AttachmentError::remote(e.to_string()))?;

        let status = response.status();
        // 409 means the object already exists; with idempotent retries that
        // is success.
        if status.is_success() || status.as_u16() == 409 {
            Ok(())
        } else {
            Err(AttachmentError::remote(format!(
                "upload of {filename} failed with HTTP {status}"
            )))
        }
    }

    async fn download_file(&self, filename: &str) -> Result<Vec<u8>, AttachmentError> {
        let response = self
            .authed(self.http.get(self.object_url(filename)))?
            .send()
            .await
            .map_err(|e| AttachmentError::remote(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(AttachmentError::NotFound(filename.to_string()));
        }
        if !status.is_success() {
            return Err(AttachmentError::remote(format!(
                "download of {filename} failed with HTTP {status}"
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AttachmentError::remote(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn delete_file(&self, filename: &str) -> Result<(), AttachmentError> {
        let response = self
            .authed(self.http.delete(self.object_url(filename)))?
            .send()
            .await
            .map_err(|e| AttachmentError::remote(e.to_string()))?;

        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            Ok(())
        } else {
            Err(AttachmentError::remote(format!(
                "delete of {filename} failed with HTTP {status}"
            )))
        }
    }
}
