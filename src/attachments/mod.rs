//! Attachment replication engine.
//!
//! [`AttachmentQueue`] watches a user-supplied query whose rows name the
//! attachment ids currently referenced by live records, reconciles that set
//! against local and remote storage on a throttled schedule, and moves bytes
//! through the [`LocalStorageAdapter`] / [`RemoteStorageAdapter`] pair.
//! Unreferenced attachments are archived rather than deleted, and archived
//! entries beyond the configured cache limit are evicted oldest-first.
//!
//! Byte-transfer failures never propagate: the attachment keeps its queued
//! state and the next reconciliation tick retries.

pub mod local;
pub mod record;
pub mod remote;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::db::{Database, WatchHandle, WatchOptions, WriteTransaction};
use crate::error::{AttachmentError, Result};

pub use local::{FilesystemStorage, LocalStorageAdapter};
pub use record::{AttachmentRecord, AttachmentState};
pub use remote::{HttpRemoteStorage, RemoteStorageAdapter};

// ============================================================================
// Watched attachments
// ============================================================================

/// One row of the watched query: an attachment id currently referenced by at
/// least one live record, with an optional file extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedAttachment {
    pub id: String,
    pub file_extension: Option<String>,
}

impl WatchedAttachment {
    fn filename(&self) -> String {
        match &self.file_extension {
            Some(ext) => format!("{}.{ext}", self.id),
            None => self.id.clone(),
        }
    }
}

/// Interpret watched-query rows as `{id, file_extension}` tuples. Rows
/// without an `id` column are skipped.
fn parse_watched_rows(rows: &[Value]) -> Vec<WatchedAttachment> {
    rows.iter()
        .filter_map(|row| {
            let id = row.get("id")?.as_str()?.to_string();
            let file_extension = row
                .get("file_extension")
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(WatchedAttachment { id, file_extension })
        })
        .collect()
}

// ============================================================================
// Options
// ============================================================================

/// Configuration for [`AttachmentQueue`].
#[derive(Debug, Clone)]
pub struct AttachmentQueueOptions {
    /// Query whose result rows are `{id, file_extension}` tuples denoting
    /// attachments currently in use.
    pub watch_query: String,
    pub watch_params: Vec<Value>,
    /// Fixed reconciliation interval.
    pub sync_interval: Duration,
    /// Minimum gap between reconciliation passes (coalesces watch bursts).
    pub sync_throttle: Duration,
    /// Archived entries retained before oldest-first eviction kicks in.
    pub archived_cache_limit: usize,
    /// Whether queued downloads are fetched. When off, records stay queued
    /// until the toggle is enabled.
    pub download_attachments: bool,
}

impl AttachmentQueueOptions {
    pub fn new(watch_query: impl Into<String>) -> Self {
        Self {
            watch_query: watch_query.into(),
            watch_params: Vec::new(),
            sync_interval: Duration::from_secs(30),
            sync_throttle: Duration::from_secs(1),
            archived_cache_limit: 100,
            download_attachments: true,
        }
    }

    pub fn watch_params(mut self, params: Vec<Value>) -> Self {
        self.watch_params = params;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn sync_throttle(mut self, throttle: Duration) -> Self {
        self.sync_throttle = throttle;
        self
    }

    pub fn archived_cache_limit(mut self, limit: usize) -> Self {
        self.archived_cache_limit = limit;
        self
    }

    pub fn download_attachments(mut self, enabled: bool) -> Self {
        self.download_attachments = enabled;
        self
    }
}

// ============================================================================
// AttachmentQueue
// ============================================================================

struct QueueShared {
    watched: Mutex<Vec<WatchedAttachment>>,
    wake: Notify,
    stop_notify: Notify,
    stopped: AtomicBool,
    last_run: Mutex<Option<Instant>>,
}

pub struct AttachmentQueue {
    db: Database,
    local: Arc<dyn LocalStorageAdapter>,
    remote: Arc<dyn RemoteStorageAdapter>,
    options: AttachmentQueueOptions,
    shared: Arc<QueueShared>,
    watch_handle: Mutex<Option<WatchHandle>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl AttachmentQueue {
    pub fn new(
        db: Database,
        local: Arc<dyn LocalStorageAdapter>,
        remote: Arc<dyn RemoteStorageAdapter>,
        options: AttachmentQueueOptions,
    ) -> Self {
        Self {
            db,
            local,
            remote,
            options,
            shared: Arc::new(QueueShared {
                watched: Mutex::new(Vec::new()),
                wake: Notify::new(),
                stop_notify: Notify::new(),
                stopped: AtomicBool::new(false),
                last_run: Mutex::new(None),
            }),
            watch_handle: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn local(&self) -> &Arc<dyn LocalStorageAdapter> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStorageAdapter> {
        &self.remote
    }

    /// Look up a tracked attachment.
    pub fn record(&self, id: &str) -> Result<Option<AttachmentRecord>> {
        record::get(&self.db, id)
    }

    /// All tracked attachments, oldest first.
    pub fn records(&self) -> Result<Vec<AttachmentRecord>> {
        record::all(&self.db)
    }

    /// Replace the watched set programmatically.
    ///
    /// Alternative to `watch_query` for callers that track references
    /// themselves; also what the registered watch feeds internally.
    pub fn set_watched(&self, items: Vec<WatchedAttachment>) {
        *self.shared.watched.lock() = items;
        self.shared.wake.notify_one();
    }

    /// Read an attachment's bytes from local storage by id.
    pub async fn read_file(&self, id: &str) -> Result<Vec<u8>> {
        let record = self
            .record(id)?
            .ok_or_else(|| AttachmentError::NotFound(id.to_string()))?;
        let uri = self.local.local_uri(&record.filename);
        Ok(self.local.read_file(&uri).await?)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register the watched query and spawn the reconciliation task.
    pub fn start_sync(self: &Arc<Self>) -> Result<()> {
        {
            let mut handle = self.watch_handle.lock();
            if handle.is_some() {
                return Ok(());
            }
            let shared = Arc::clone(&self.shared);
            *handle = Some(self.db.watch(
                &self.options.watch_query,
                &self.options.watch_params,
                WatchOptions::default(),
                move |rows| {
                    *shared.watched.lock() = parse_watched_rows(rows);
                    shared.wake.notify_one();
                },
            )?);
        }
        let this = Arc::clone(self);
        self.tasks.lock().push(tokio::spawn(this.run()));
        Ok(())
    }

    /// Cancel the watch subscription and stop the reconciliation task.
    /// In-flight transfers are abandoned; queued states stay durable.
    pub async fn stop_sync(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.stop_notify.notify_waiters();
        if let Some(handle) = self.watch_handle.lock().take() {
            handle.unsubscribe();
        }
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.is_stopped() {
                break;
            }
            tokio::select! {
                _ = self.shared.wake.notified() => {}
                _ = tokio::time::sleep(self.options.sync_interval) => {}
                _ = self.shared.stop_notify.notified() => {}
            }
            if self.is_stopped() {
                break;
            }
            self.throttle_gate().await;
            if self.is_stopped() {
                break;
            }
            if let Err(e) = self.reconcile_once().await {
                tracing::warn!(error = %e, "attachment reconciliation failed");
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Sleep until the next eligible run time, then stamp this run.
    async fn throttle_gate(&self) {
        let wait = {
            let last = self.shared.last_run.lock();
            last.map(|t| {
                (t + self.options.sync_throttle).saturating_duration_since(Instant::now())
            })
            .filter(|d| !d.is_zero())
        };
        if let Some(delay) = wait {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shared.stop_notify.notified() => {}
            }
        }
        *self.shared.last_run.lock() = Some(Instant::now());
    }

    // -----------------------------------------------------------------------
    // Saving and deleting
    // -----------------------------------------------------------------------

    /// Store a new attachment.
    ///
    /// The bytes are written to local storage first; then one store
    /// transaction inserts the attachment record (queued for upload) and
    /// runs `update_hook`, so the record and the caller's referencing row
    /// commit atomically — a crash in between leaves no dangling reference.
    pub async fn save_file<F>(
        &self,
        data: &[u8],
        extension: &str,
        media_type: &str,
        update_hook: F,
    ) -> Result<AttachmentRecord>
    where
        F: FnOnce(&WriteTransaction<'_>, &AttachmentRecord) -> Result<()>,
    {
        let id = Uuid::new_v4().to_string();
        let filename = format!("{id}.{extension}");
        let uri = self.local.local_uri(&filename);
        self.local.save_file(&uri, data).await?;

        let record = AttachmentRecord {
            id,
            filename,
            media_type: Some(media_type.to_string()),
            state: AttachmentState::QueuedUpload,
            has_local: true,
            updated_at: Utc::now(),
        };
        self.db.write_transaction(|tx| {
            record::upsert_in_tx(tx, &record)?;
            update_hook(tx, &record)
        })?;
        self.shared.wake.notify_one();
        Ok(record)
    }

    /// Delete an attachment.
    ///
    /// One store transaction flips the record to `QueuedDelete` and runs
    /// `update_hook` (which removes the referencing row); the actual local
    /// and remote byte deletion happens asynchronously on the next
    /// reconciliation pass.
    pub async fn delete_file<F>(&self, id: &str, update_hook: F) -> Result<()>
    where
        F: FnOnce(&WriteTransaction<'_>) -> Result<()>,
    {
        self.db.write_transaction(|tx| {
            let updated = record::set_state_in_tx(tx, id, AttachmentState::QueuedDelete)?;
            if updated == 0 {
                return Err(AttachmentError::NotFound(id.to_string()).into());
            }
            update_hook(tx)
        })?;
        self.shared.wake.notify_one();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Run one reconciliation pass now.
    ///
    /// Storage errors propagate; individual byte-transfer failures are
    /// logged and leave the affected attachment in its queued state.
    pub async fn reconcile_once(&self) -> Result<()> {
        let watched: Vec<WatchedAttachment> = self.shared.watched.lock().clone();
        let watched_ids: HashSet<&str> = watched.iter().map(|w| w.id.as_str()).collect();

        let records = record::all(&self.db)?;
        let by_id: HashMap<&str, &AttachmentRecord> =
            records.iter().map(|r| (r.id.as_str(), r)).collect();

        // Watched ids with no record are downloads from another device;
        // archived ones that reappear in the watched set are restored.
        for item in &watched {
            match by_id.get(item.id.as_str()) {
                None => {
                    record::upsert(
                        &self.db,
                        &AttachmentRecord {
                            id: item.id.clone(),
                            filename: item.filename(),
                            media_type: None,
                            state: AttachmentState::QueuedDownload,
                            has_local: false,
                            updated_at: Utc::now(),
                        },
                    )?;
                }
                Some(r) if r.state == AttachmentState::Archived => {
                    let restored = if r.has_local {
                        AttachmentState::Synced
                    } else {
                        AttachmentState::QueuedDownload
                    };
                    record::set_state(&self.db, &r.id, restored)?;
                }
                _ => {}
            }
        }

        // Tracked ids that fell out of the watched set are soft-deleted.
        for r in &records {
            let unreferenced = !watched_ids.contains(r.id.as_str());
            let archivable = matches!(
                r.state,
                AttachmentState::QueuedUpload
                    | AttachmentState::QueuedDownload
                    | AttachmentState::Synced
            );
            if unreferenced && archivable {
                record::set_state(&self.db, &r.id, AttachmentState::Archived)?;
            }
        }

        // Move bytes for everything still queued.
        for r in record::all(&self.db)? {
            if self.is_stopped() {
                return Ok(());
            }
            match r.state {
                AttachmentState::QueuedUpload => self.process_upload(&r).await,
                AttachmentState::QueuedDownload if self.options.download_attachments => {
                    self.process_download(&r).await
                }
                AttachmentState::QueuedDelete => self.process_delete(&r).await,
                _ => {}
            }
        }

        self.evict_archived().await
    }

    async fn process_upload(&self, r: &AttachmentRecord) {
        let uri = self.local.local_uri(&r.filename);
        let bytes = match self.local.read_file(&uri).await {
            Ok(bytes) => bytes,
            Err(AttachmentError::NotFound(_)) => {
                // Local bytes vanished; the remote copy (if any) is the only
                // source left.
                tracing::warn!(id = %r.id, "queued upload has no local bytes, requeueing as download");
                if let Err(e) = record::set_state(&self.db, &r.id, AttachmentState::QueuedDownload)
                {
                    tracing::warn!(id = %r.id, error = %e, "failed to requeue attachment");
                }
                return;
            }
            Err(e) => {
                tracing::warn!(id = %r.id, error = %e, "failed to read attachment for upload");
                return;
            }
        };
        match self
            .remote
            .upload_file(&r.filename, &bytes, r.media_type.as_deref())
            .await
        {
            Ok(()) => {
                if let Err(e) = record::set_synced(&self.db, &r.id, true) {
                    tracing::warn!(id = %r.id, error = %e, "failed to mark attachment synced");
                }
            }
            Err(e) => tracing::warn!(id = %r.id, error = %e, "attachment upload failed, will retry"),
        }
    }

    async fn process_download(&self, r: &AttachmentRecord) {
        let bytes = match self.remote.download_file(&r.filename).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(id = %r.id, error = %e, "attachment download failed, will retry");
                return;
            }
        };
        let uri = self.local.local_uri(&r.filename);
        match self.local.save_file(&uri, &bytes).await {
            Ok(_) => {
                if let Err(e) = record::set_synced(&self.db, &r.id, true) {
                    tracing::warn!(id = %r.id, error = %e, "failed to mark attachment synced");
                }
            }
            Err(e) => tracing::warn!(id = %r.id, error = %e, "failed to store downloaded attachment"),
        }
    }

    async fn process_delete(&self, r: &AttachmentRecord) {
        if let Err(e) = self.remote.delete_file(&r.filename).await {
            tracing::warn!(id = %r.id, error = %e, "remote attachment delete failed, will retry");
            return;
        }
        let uri = self.local.local_uri(&r.filename);
        if let Err(e) = self.local.delete_file(&uri).await {
            tracing::warn!(id = %r.id, error = %e, "local attachment delete failed, will retry");
            return;
        }
        if let Err(e) = record::remove(&self.db, &r.id) {
            tracing::warn!(id = %r.id, error = %e, "failed to drop attachment record");
        }
    }

    /// Evict the oldest archived entries beyond the cache limit: remote
    /// bytes, local bytes, then the record.
    async fn evict_archived(&self) -> Result<()> {
        let archived: Vec<AttachmentRecord> = record::all(&self.db)?
            .into_iter()
            .filter(|r| r.state == AttachmentState::Archived)
            .collect();
        if archived.len() <= self.options.archived_cache_limit {
            return Ok(());
        }

        let excess = archived.len() - self.options.archived_cache_limit;
        for r in archived.into_iter().take(excess) {
            if let Err(e) = self.remote.delete_file(&r.filename).await {
                tracing::warn!(id = %r.id, error = %e, "eviction: remote delete failed, will retry");
                continue;
            }
            let uri = self.local.local_uri(&r.filename);
            if let Err(e) = self.local.delete_file(&uri).await {
                tracing::warn!(id = %r.id, error = %e, "eviction: local delete failed, will retry");
                continue;
            }
            record::remove(&self.db, &r.id)?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
