//! Sync stream client — pulls authoritative server state into the store.
//!
//! The client holds a logical connection to the sync service through the
//! [`SyncStream`] trait: fetch credentials from the connector, pull change
//! batches from the stream, merge them into the store (bypassing the
//! mutation queue) and advance a durable checkpoint. Credential expiry
//! triggers a re-fetch; disconnects reconnect with backoff while observers
//! see `connected = false`. Connecting also starts the uploader, so both
//! directions share one lifecycle and one [`SyncStatus`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use crate::connector::Connector;
use crate::db::Database;
use crate::error::{ConnectorError, FootprintDbError, Result, StorageError};
use crate::sync::status::{StatusTracker, SyncStatus};
use crate::sync::uploader::{RetryConfig, Uploader};
use crate::types::{Credentials, RemoteBatch};

const META_CHECKPOINT: &str = "sync_checkpoint";
const META_LAST_SYNCED_AT: &str = "sync_last_synced_at";

// ============================================================================
// SyncStream — user-provided change-stream layer
// ============================================================================

/// Transport for pulling remote changes.
///
/// Implementations talk to the sync service (HTTP long-poll, WebSocket,
/// etc.). A call may block server-side until changes are available; the
/// client simply awaits it.
#[async_trait]
pub trait SyncStream: Send + Sync {
    /// Pull changes committed after the `since` checkpoint.
    async fn pull_changes(
        &self,
        credentials: &Credentials,
        since: i64,
    ) -> std::result::Result<RemoteBatch, StreamError>;
}

/// Classification of stream failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// Retriable (network, temporary failures).
    Transient,
    /// Credentials rejected — re-fetch before retrying.
    Auth,
}

/// Stream-level error.
#[derive(Debug, Clone)]
pub struct StreamError {
    pub message: String,
    pub kind: StreamErrorKind,
}

impl StreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: StreamErrorKind::Transient,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: StreamErrorKind::Auth,
        }
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StreamError {}

// ============================================================================
// SyncOptions
// ============================================================================

/// Configuration for [`SyncClient`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Backoff for reconnection and transient pull failures.
    pub retry: RetryConfig,
    /// Delay between pulls once a checkpoint is complete.
    pub poll_interval: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// SyncClient
// ============================================================================

pub struct SyncClient {
    db: Database,
    connector: Arc<dyn Connector>,
    stream: Arc<dyn SyncStream>,
    options: SyncOptions,
    status: Arc<StatusTracker>,
    uploader: Arc<Uploader>,
    stopped: AtomicBool,
    stop_notify: Notify,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SyncClient {
    pub fn new(
        db: Database,
        connector: Arc<dyn Connector>,
        stream: Arc<dyn SyncStream>,
        options: SyncOptions,
    ) -> Self {
        // Seed status from the persisted sync markers so a restarted app
        // knows it has synced before even while offline.
        let last_synced_at = db
            .get_meta(META_LAST_SYNCED_AT)
            .ok()
            .flatten()
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc));
        let status = Arc::new(StatusTracker::new(SyncStatus {
            has_synced: last_synced_at.is_some(),
            last_synced_at,
            ..SyncStatus::default()
        }));
        let uploader = Arc::new(Uploader::with_status(
            db.clone(),
            Arc::clone(&connector),
            options.retry.clone(),
            Arc::clone(&status),
        ));
        Self {
            db,
            connector,
            stream,
            options,
            status,
            uploader,
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> SyncStatus {
        self.status.current()
    }

    /// Subscribe to status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn uploader(&self) -> &Arc<Uploader> {
        &self.uploader
    }

    /// Start the download loop and the uploader.
    pub fn connect(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.uploader.spawn());
        let this = Arc::clone(self);
        tasks.push(tokio::spawn(this.run_download()));
    }

    /// Stop both directions and wait for the tasks to finish. Queued
    /// mutations stay durable in the store.
    pub async fn disconnect(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        self.uploader.stop();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.status.update(|s| {
            s.connected = false;
            s.connecting = false;
            s.data_flow.uploading = false;
            s.data_flow.downloading = false;
        });
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Download loop
    // -----------------------------------------------------------------------

    async fn run_download(self: Arc<Self>) {
        let mut attempt: u32 = 0;

        'reconnect: loop {
            if self.is_stopped() {
                break;
            }

            self.status.update(|s| s.connecting = true);
            let credentials = match self.connector.fetch_credentials().await {
                Ok(c) => c,
                Err(e) => {
                    // No session is the expected local-only state; anything
                    // else is worth a warning. Both retry with backoff.
                    if !matches!(e, ConnectorError::NoSession) {
                        tracing::warn!(error = %e, "failed to fetch sync credentials");
                    }
                    self.status.update(|s| {
                        s.connecting = false;
                        s.connected = false;
                    });
                    self.backoff_sleep(attempt).await;
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };
            self.status.update(|s| {
                s.connecting = false;
                s.connected = true;
            });

            loop {
                if self.is_stopped() {
                    break 'reconnect;
                }
                if credentials.is_expired() {
                    continue 'reconnect;
                }

                match self.pull_once(&credentials).await {
                    Ok(PullStep::MoreAvailable) => {
                        attempt = 0;
                    }
                    Ok(PullStep::CheckpointComplete) => {
                        attempt = 0;
                        self.idle_sleep(self.options.poll_interval).await;
                    }
                    Err(PullFailure::Auth(message)) => {
                        tracing::debug!(%message, "sync credentials rejected, refreshing");
                        self.status.update(|s| {
                            s.connected = false;
                            s.data_flow.downloading = false;
                        });
                        continue 'reconnect;
                    }
                    Err(PullFailure::Transient(message)) => {
                        self.status.update(|s| {
                            s.connected = false;
                            s.data_flow.downloading = false;
                            s.data_flow.download_error = Some(message);
                        });
                        self.backoff_sleep(attempt).await;
                        attempt = attempt.saturating_add(1);
                        continue 'reconnect;
                    }
                    Err(PullFailure::Closed) => break 'reconnect,
                }
            }
        }
    }

    /// One pull + apply + checkpoint step.
    async fn pull_once(&self, credentials: &Credentials) -> std::result::Result<PullStep, PullFailure> {
        let since = self.checkpoint().map_err(PullFailure::from_storage)?;

        let batch = self
            .stream
            .pull_changes(credentials, since)
            .await
            .map_err(|e| match e.kind {
                StreamErrorKind::Auth => PullFailure::Auth(e.message),
                StreamErrorKind::Transient => PullFailure::Transient(e.message),
            })?;

        if !batch.changes.is_empty() {
            self.status.update(|s| s.data_flow.downloading = true);
            self.db
                .apply_remote_changes(&batch.changes)
                .map_err(PullFailure::from_storage)?;
        }
        self.set_checkpoint(batch.checkpoint)
            .map_err(PullFailure::from_storage)?;

        if batch.has_more {
            return Ok(PullStep::MoreAvailable);
        }

        let now = Utc::now();
        let _ = self.db.set_meta(META_LAST_SYNCED_AT, &now.to_rfc3339());
        self.status.update(|s| {
            s.data_flow.downloading = false;
            s.data_flow.download_error = None;
            s.has_synced = true;
            s.last_synced_at = Some(now);
        });
        Ok(PullStep::CheckpointComplete)
    }

    fn checkpoint(&self) -> Result<i64> {
        Ok(self
            .db
            .get_meta(META_CHECKPOINT)?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }

    fn set_checkpoint(&self, checkpoint: i64) -> Result<()> {
        self.db.set_meta(META_CHECKPOINT, &checkpoint.to_string())
    }

    async fn backoff_sleep(&self, attempt: u32) {
        self.idle_sleep(self.options.retry.delay_for(attempt)).await;
    }

    async fn idle_sleep(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.stop_notify.notified() => {}
        }
    }
}

enum PullStep {
    MoreAvailable,
    CheckpointComplete,
}

enum PullFailure {
    Transient(String),
    Auth(String),
    Closed,
}

impl PullFailure {
    fn from_storage(e: FootprintDbError) -> Self {
        match e {
            FootprintDbError::Storage(StorageError::Closed) => PullFailure::Closed,
            other => PullFailure::Transient(other.to_string()),
        }
    }
}
