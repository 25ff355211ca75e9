//! Uploader — drains the mutation queue to the backend, one transaction at
//! a time, in commit order.
//!
//! The protocol per transaction: dispatch each entry to the connector in
//! sequence order; a transient failure aborts the attempt and leaves the
//! transaction queued for retry with backoff; a fatal failure (classified by
//! the connector) discards the remainder and completes the transaction so it
//! cannot block the queue forever. The typed [`UploadOutcome`] makes the
//! triage testable without a network.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::connector::{BackendError, Connector};
use crate::db::{CrudTransaction, Database, WatchHandle};
use crate::error::{FootprintDbError, Result, StorageError};
use crate::sync::status::StatusTracker;

// ============================================================================
// RetryConfig
// ============================================================================

/// Exponential backoff settings for transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Backoff multiplier (1.0 = constant delay, 2.0 = double each time).
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the `attempt`-th retry (0-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

// ============================================================================
// UploadOutcome
// ============================================================================

/// Result of one upload cycle.
#[derive(Debug)]
pub enum UploadOutcome {
    /// The queue was empty.
    Idle,
    /// Every entry was applied and the transaction completed.
    Completed { tx_id: i64 },
    /// A fatal backend error: the transaction was discarded and completed
    /// so the queue can advance. Indicates an application/schema bug.
    Discarded { tx_id: i64, error: BackendError },
    /// A transient failure: the transaction stays queued; retry after
    /// backoff.
    Retry { error: BackendError },
}

// ============================================================================
// Uploader
// ============================================================================

pub struct Uploader {
    db: Database,
    connector: Arc<dyn Connector>,
    retry: RetryConfig,
    status: Arc<StatusTracker>,
    /// Serializes upload cycles: at most one transaction in flight, ever.
    upload_lock: tokio::sync::Mutex<()>,
    in_flight: AtomicUsize,
    wake: Notify,
    stop_notify: Notify,
    stopped: AtomicBool,
}

impl Uploader {
    pub fn new(db: Database, connector: Arc<dyn Connector>, retry: RetryConfig) -> Self {
        Self::with_status(db, connector, retry, Arc::new(StatusTracker::default()))
    }

    pub(crate) fn with_status(
        db: Database,
        connector: Arc<dyn Connector>,
        retry: RetryConfig,
        status: Arc<StatusTracker>,
    ) -> Self {
        Self {
            db,
            connector,
            retry,
            status,
            upload_lock: tokio::sync::Mutex::new(()),
            in_flight: AtomicUsize::new(0),
            wake: Notify::new(),
            stop_notify: Notify::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Number of upload attempts currently in flight. Never exceeds 1.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Nudge the drain loop (new mutations were committed).
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Stop the drain loop. Queued transactions stay durable in the store.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        self.wake.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Spawn the background drain loop.
    ///
    /// The loop subscribes to store changes so newly committed mutations
    /// wake it immediately, uploads until the queue is empty, and backs off
    /// on transient failures.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(this.run())
    }

    async fn run(self: Arc<Self>) {
        let wake_sub = self.subscribe_to_queue_changes();
        let mut attempt: u32 = 0;

        loop {
            if self.is_stopped() {
                break;
            }
            match self.upload_next().await {
                Ok(UploadOutcome::Idle) => {
                    attempt = 0;
                    self.wait_for_wake().await;
                }
                Ok(UploadOutcome::Completed { .. }) | Ok(UploadOutcome::Discarded { .. }) => {
                    attempt = 0;
                }
                Ok(UploadOutcome::Retry { error }) => {
                    let delay = self.retry.delay_for(attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::debug!(%error, ?delay, "transient upload failure, backing off");
                    self.backoff_sleep(delay).await;
                }
                Err(FootprintDbError::Storage(StorageError::Closed)) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "uploader storage error");
                    self.backoff_sleep(self.retry.delay_for(attempt)).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
        drop(wake_sub);
    }

    /// Run one upload cycle: fetch the next queued transaction and attempt
    /// to apply it. Serialized — concurrent callers queue behind the lock.
    pub async fn upload_next(&self) -> Result<UploadOutcome> {
        let _guard = self.upload_lock.lock().await;

        let Some(tx) = self.db.next_crud_transaction()? else {
            self.status.update(|s| s.data_flow.uploading = false);
            return Ok(UploadOutcome::Idle);
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.status.update(|s| s.data_flow.uploading = true);
        let outcome = self.upload_transaction(tx).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn upload_transaction(&self, tx: CrudTransaction) -> Result<UploadOutcome> {
        let tx_id = tx.tx_id;
        let entries = tx.entries.clone();

        for entry in entries {
            let prepared = self.connector.prepare_upload(entry);
            match self.connector.apply_crud(&prepared).await {
                Ok(()) => {}
                Err(error) if self.connector.is_fatal(&error) => {
                    tracing::warn!(
                        tx_id,
                        code = ?error.code,
                        %error,
                        "discarding transaction after fatal backend error"
                    );
                    tx.complete()?;
                    self.status
                        .update(|s| s.data_flow.upload_error = Some(error.to_string()));
                    return Ok(UploadOutcome::Discarded { tx_id, error });
                }
                Err(error) => {
                    self.status
                        .update(|s| s.data_flow.upload_error = Some(error.to_string()));
                    return Ok(UploadOutcome::Retry { error });
                }
            }
        }

        tx.complete()?;
        self.status.update(|s| s.data_flow.upload_error = None);
        Ok(UploadOutcome::Completed { tx_id })
    }

    fn subscribe_to_queue_changes(self: &Arc<Self>) -> WatchHandle {
        let this = Arc::downgrade(self);
        self.db.subscribe_changes(move |event| {
            if event.touches("fp_crud") {
                if let Some(uploader) = this.upgrade() {
                    uploader.wake.notify_one();
                }
            }
        })
    }

    async fn wait_for_wake(&self) {
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = self.stop_notify.notified() => {}
        }
    }

    async fn backoff_sleep(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.stop_notify.notified() => {}
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
