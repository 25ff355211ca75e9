//! Change notification and live-query subscriptions.
//!
//! The store emits one [`ChangeEvent`] per committed write transaction,
//! listing every table the transaction touched (collected from SQLite's
//! update hook, so remote merges are reported exactly like local writes).
//! [`WatchHandle`]s returned by `Database::watch` deregister their listener
//! on `unsubscribe()` or drop; no callback fires after cancellation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Prefix shared by the engine's internal tables (`fp_crud`, `fp_meta`,
/// `fp_attachments`). Watches without an explicit table list ignore these.
pub(crate) const INTERNAL_TABLE_PREFIX: &str = "fp_";

// ============================================================================
// ChangeEvent
// ============================================================================

/// Emitted after every committed write transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Names of all tables the transaction wrote to, internal ones included.
    pub tables: HashSet<String>,
}

impl ChangeEvent {
    pub(crate) fn new(tables: HashSet<String>) -> Self {
        Self { tables }
    }

    /// Whether any non-internal table changed.
    pub fn touches_user_tables(&self) -> bool {
        self.tables
            .iter()
            .any(|t| !t.starts_with(INTERNAL_TABLE_PREFIX))
    }

    /// Whether a specific table changed.
    pub fn touches(&self, table: &str) -> bool {
        self.tables.contains(table)
    }
}

// ============================================================================
// EventEmitter
// ============================================================================

/// A listener ID returned by [`EventEmitter::on`] that can be passed to
/// [`EventEmitter::off`] to remove the listener.
pub type ListenerId = u64;

type ListenerFn<T> = dyn Fn(&T) + Send + Sync;

/// Typed synchronous event emitter.
///
/// Snapshot-on-emit semantics: a listener removed *during* emission is still
/// called in that round; one added during emission is not called until the
/// next emit. The internal lock is never held while callbacks run, so
/// listeners may call `on()`/`off()` freely.
pub(crate) struct EventEmitter<T> {
    listeners: Mutex<Vec<(ListenerId, Arc<ListenerFn<T>>)>>,
    next_id: AtomicU64,
}

impl<T> EventEmitter<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback` and return its [`ListenerId`].
    pub fn on(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove the listener identified by `id`. Safe to call multiple times.
    pub fn off(&self, id: ListenerId) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    /// Emit `event` to all currently registered listeners.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Arc<ListenerFn<T>>> = {
            let guard = self.listeners.lock();
            guard.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        // Lock released — callbacks can safely call on()/off().
        for cb in snapshot {
            cb(event);
        }
    }

    /// Drop every listener. Used when the database is closed.
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    #[cfg(test)]
    pub fn size(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl<T> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Watch subscriptions
// ============================================================================

/// Options for `Database::watch`.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Explicit tables that invalidate the query. When `None`, any change to
    /// a non-internal table re-runs the query (over-notification is allowed;
    /// missed notifications are not).
    pub tables: Option<Vec<String>>,
}

impl WatchOptions {
    pub fn tables(tables: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tables: Some(tables.into_iter().map(Into::into).collect()),
        }
    }

    pub(crate) fn matches(&self, event: &ChangeEvent) -> bool {
        match &self.tables {
            Some(tables) => tables.iter().any(|t| event.touches(t)),
            None => event.touches_user_tables(),
        }
    }
}

/// Cancellable handle for an active watch subscription.
///
/// Dropping the handle unsubscribes, so callers keep it alive for as long as
/// they want callbacks.
pub struct WatchHandle {
    id: ListenerId,
    emitter: Arc<EventEmitter<ChangeEvent>>,
    active: Arc<AtomicBool>,
}

impl WatchHandle {
    pub(crate) fn new(
        id: ListenerId,
        emitter: Arc<EventEmitter<ChangeEvent>>,
        active: Arc<AtomicBool>,
    ) -> Self {
        Self { id, emitter, active }
    }

    /// Stop the subscription. Idempotent; once this returns, the callback is
    /// never invoked again.
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.emitter.off(self.id);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ============================================================================
// Tests
// ============================================================================
