//! Sync status — state exposed to observers instead of thrown errors, so a
//! UI can degrade to an offline view rather than crash.

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Per-direction data-flow state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataFlowStatus {
    /// A crud transaction is being uploaded.
    pub uploading: bool,
    /// Remote changes are being pulled and applied.
    pub downloading: bool,
    /// Last upload failure, cleared on the next successful upload.
    pub upload_error: Option<String>,
    /// Last download failure, cleared on the next completed pull.
    pub download_error: Option<String>,
}

/// Snapshot of the engine's connection and sync state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// Live connection to the sync service.
    pub connected: bool,
    /// Connection attempt in progress.
    pub connecting: bool,
    /// True once at least one full sync has completed (persisted across
    /// restarts).
    pub has_synced: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub data_flow: DataFlowStatus,
}

/// Shared mutable status behind a `tokio::sync::watch` channel: writers call
/// [`update`](Self::update); observers poll [`current`](Self::current) or
/// await changes on a subscribed receiver.
pub(crate) struct StatusTracker {
    tx: watch::Sender<SyncStatus>,
}

impl StatusTracker {
    pub fn new(initial: SyncStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.tx.send_modify(f);
    }

    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new(SyncStatus::default())
    }
}
