//! Upload protocol properties: ordering, single-flight, transient retry and
//! fatal discard.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use footprint_db::connector::{BackendError, Connector, FatalCodeMatcher};
use footprint_db::db::{CrudEntry, CrudOp, Database};
use footprint_db::error::ConnectorError;
use footprint_db::schema::{Column, Schema, Table};
use footprint_db::sync::{RetryConfig, UploadOutcome, Uploader};
use footprint_db::types::Credentials;
use parking_lot::Mutex;
use serde_json::{json, Value};

// ============================================================================
// Shared mock infrastructure
// ============================================================================

type ApplyFn = dyn Fn(&CrudEntry) -> Result<(), BackendError> + Send + Sync;

struct MockConnector {
    apply_response: Mutex<Option<Box<ApplyFn>>>,
    /// Entries the backend accepted, in arrival order.
    applied: Mutex<Vec<CrudEntry>>,
    user_id: Mutex<Option<String>>,
    apply_delay: Duration,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    fatal_codes: FatalCodeMatcher,
}

impl MockConnector {
    fn new() -> Self {
        Self {
            apply_response: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            user_id: Mutex::new(None),
            apply_delay: Duration::ZERO,
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            fatal_codes: FatalCodeMatcher::postgres(),
        }
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            apply_delay: delay,
            ..Self::new()
        }
    }

    fn on_apply(&self, f: impl Fn(&CrudEntry) -> Result<(), BackendError> + Send + Sync + 'static) {
        *self.apply_response.lock() = Some(Box::new(f));
    }

    fn applied(&self) -> Vec<CrudEntry> {
        self.applied.lock().clone()
    }

    fn sign_in(&self, user: &str) {
        *self.user_id.lock() = Some(user.to_string());
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn fetch_credentials(&self) -> Result<Credentials, ConnectorError> {
        match self.user_id.lock().clone() {
            Some(user_id) => Ok(Credentials {
                endpoint: "mock://sync".to_string(),
                token: "tok".to_string(),
                user_id: Some(user_id),
                expires_at: None,
            }),
            None => Err(ConnectorError::NoSession),
        }
    }

    async fn apply_crud(&self, entry: &CrudEntry) -> Result<(), BackendError> {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        if !self.apply_delay.is_zero() {
            tokio::time::sleep(self.apply_delay).await;
        }
        let result = match &*self.apply_response.lock() {
            Some(f) => f(entry),
            None => Ok(()),
        };
        if result.is_ok() {
            self.applied.lock().push(entry.clone());
        }
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn is_fatal(&self, error: &BackendError) -> bool {
        error
            .code
            .as_deref()
            .map(|c| self.fatal_codes.matches(c))
            .unwrap_or(false)
    }

    fn prepare_upload(&self, mut entry: CrudEntry) -> CrudEntry {
        if entry.op == CrudOp::Put {
            if let Some(user_id) = self.user_id.lock().clone() {
                if let Some(Value::Object(map)) = &mut entry.data {
                    if matches!(map.get("user_id"), None | Some(Value::Null)) {
                        map.insert("user_id".to_string(), Value::String(user_id));
                    }
                }
            }
        }
        entry
    }

    fn user_id(&self) -> Option<String> {
        self.user_id.lock().clone()
    }
}

fn open_db() -> Database {
    let schema = Schema::new(vec![Table::new("sightings")
        .column(Column::text("date"))
        .column(Column::text("comments"))
        .column(Column::text("user_id"))]);
    Database::open_in_memory(schema).unwrap()
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        multiplier: 2.0,
    }
}

fn insert(db: &Database, id: &str, comments: &str) {
    db.execute(
        "INSERT INTO sightings (id, comments, user_id) VALUES (?1, ?2, NULL)",
        &[json!(id), json!(comments)],
    )
    .unwrap();
}

/// Drive upload cycles until the queue is empty, collecting outcomes.
async fn drain(uploader: &Uploader) -> Vec<UploadOutcome> {
    let mut outcomes = Vec::new();
    loop {
        let outcome = uploader.upload_next().await.unwrap();
        let done = matches!(outcome, UploadOutcome::Idle);
        outcomes.push(outcome);
        if done {
            return outcomes;
        }
    }
}

// ============================================================================
// Ordering and success
// ============================================================================

#[tokio::test]
async fn uploads_transactions_in_commit_order() {
    let db = open_db();
    let connector = Arc::new(MockConnector::new());
    let uploader = Uploader::new(db.clone(), connector.clone(), fast_retry());

    insert(&db, "a", "one");
    insert(&db, "b", "two");
    insert(&db, "c", "three");

    drain(&uploader).await;

    let ids: Vec<String> = connector.applied().iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(db.crud_transaction_count().unwrap(), 0);
}

#[tokio::test]
async fn offline_mutations_converge_on_the_backend_in_order() {
    let db = open_db();
    let connector = Arc::new(MockConnector::new());
    let uploader = Uploader::new(db.clone(), connector.clone(), fast_retry());

    // Offline: create, edit, create another, delete the second.
    insert(&db, "a", "v1");
    db.execute("UPDATE sightings SET comments = 'v2' WHERE id = 'a'", &[]).unwrap();
    insert(&db, "b", "short-lived");
    db.execute("DELETE FROM sightings WHERE id = 'b'", &[]).unwrap();

    drain(&uploader).await;

    // Replay the accepted entries into a model backend.
    let mut backend: HashMap<String, Value> = HashMap::new();
    for entry in connector.applied() {
        match entry.op {
            CrudOp::Put => {
                backend.insert(entry.id.clone(), entry.data.clone().unwrap());
            }
            CrudOp::Patch => {
                if let Some(Value::Object(row)) = backend.get_mut(&entry.id) {
                    if let Some(Value::Object(patch)) = entry.data {
                        for (k, v) in patch {
                            row.insert(k, v);
                        }
                    }
                }
            }
            CrudOp::Delete => {
                backend.remove(&entry.id);
            }
        }
    }

    assert_eq!(backend.len(), 1);
    assert_eq!(backend["a"]["comments"], json!("v2"));
}

// ============================================================================
// Transient failures
// ============================================================================

#[tokio::test]
async fn transient_errors_are_retried_until_success() {
    let db = open_db();
    let connector = Arc::new(MockConnector::new());
    let uploader = Uploader::new(db.clone(), connector.clone(), fast_retry());

    let failures_left = AtomicUsize::new(2);
    connector.on_apply(move |_| {
        if failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(BackendError::network("connection reset"))
        } else {
            Ok(())
        }
    });

    insert(&db, "a", "persistent");

    let r1 = uploader.upload_next().await.unwrap();
    assert!(matches!(r1, UploadOutcome::Retry { .. }));
    assert_eq!(db.crud_transaction_count().unwrap(), 1);

    let r2 = uploader.upload_next().await.unwrap();
    assert!(matches!(r2, UploadOutcome::Retry { .. }));
    assert_eq!(db.crud_transaction_count().unwrap(), 1);

    let r3 = uploader.upload_next().await.unwrap();
    assert!(matches!(r3, UploadOutcome::Completed { .. }));
    assert_eq!(db.crud_transaction_count().unwrap(), 0);
    assert_eq!(connector.applied().len(), 1);
}

#[tokio::test]
async fn missing_credentials_never_drop_the_transaction() {
    let db = open_db();
    let connector = Arc::new(MockConnector::new());
    let uploader = Uploader::new(db.clone(), connector.clone(), fast_retry());

    connector.on_apply(|_| Err(BackendError::network("no session available for upload")));
    insert(&db, "a", "waiting for sign-in");

    for _ in 0..5 {
        let outcome = uploader.upload_next().await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Retry { .. }));
    }
    assert_eq!(db.crud_transaction_count().unwrap(), 1);
}

#[tokio::test]
async fn multi_entry_transaction_retries_from_the_start() {
    let db = open_db();
    let connector = Arc::new(MockConnector::new());
    let uploader = Uploader::new(db.clone(), connector.clone(), fast_retry());

    db.write_transaction(|tx| {
        tx.execute("INSERT INTO sightings (id, comments) VALUES ('a', 'one')", &[])?;
        tx.execute("INSERT INTO sightings (id, comments) VALUES ('b', 'two')", &[])?;
        Ok(())
    })
    .unwrap();

    // The second entry fails once; the whole transaction attempt aborts.
    let failed_once = AtomicUsize::new(0);
    connector.on_apply(move |entry| {
        if entry.id == "b" && failed_once.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(BackendError::network("flaky backend"))
        } else {
            Ok(())
        }
    });

    let r1 = uploader.upload_next().await.unwrap();
    assert!(matches!(r1, UploadOutcome::Retry { .. }));
    let r2 = uploader.upload_next().await.unwrap();
    assert!(matches!(r2, UploadOutcome::Completed { .. }));

    // "a" was re-sent on the retry — upsert-by-id makes that safe.
    let ids: Vec<String> = connector.applied().iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, vec!["a", "a", "b"]);
}

// ============================================================================
// Fatal failures
// ============================================================================

#[tokio::test]
async fn fatal_error_discards_the_transaction_and_advances() {
    let db = open_db();
    let connector = Arc::new(MockConnector::new());
    let uploader = Uploader::new(db.clone(), connector.clone(), fast_retry());

    let attempts_on_a = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts_on_a);
    connector.on_apply(move |entry| {
        if entry.id == "a" {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::with_code("unique violation", "23505", Some(409)))
        } else {
            Ok(())
        }
    });

    insert(&db, "a", "doomed");
    insert(&db, "b", "fine");

    let r1 = uploader.upload_next().await.unwrap();
    assert!(matches!(r1, UploadOutcome::Discarded { .. }));
    // The fatal transaction is gone; only "b" remains.
    assert_eq!(db.crud_transaction_count().unwrap(), 1);

    let r2 = uploader.upload_next().await.unwrap();
    assert!(matches!(r2, UploadOutcome::Completed { .. }));
    let r3 = uploader.upload_next().await.unwrap();
    assert!(matches!(r3, UploadOutcome::Idle));

    // Never retried after the discard.
    assert_eq!(attempts_on_a.load(Ordering::SeqCst), 1);
    let ids: Vec<String> = connector.applied().iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, vec!["b"]);
}

#[tokio::test]
async fn fatal_mid_transaction_discards_the_remaining_entries() {
    let db = open_db();
    let connector = Arc::new(MockConnector::new());
    let uploader = Uploader::new(db.clone(), connector.clone(), fast_retry());

    db.write_transaction(|tx| {
        tx.execute("INSERT INTO sightings (id, comments) VALUES ('a', 'ok')", &[])?;
        tx.execute("INSERT INTO sightings (id, comments) VALUES ('bad', 'rejected')", &[])?;
        tx.execute("INSERT INTO sightings (id, comments) VALUES ('c', 'never sent')", &[])?;
        Ok(())
    })
    .unwrap();

    connector.on_apply(|entry| {
        if entry.id == "bad" {
            Err(BackendError::with_code("type mismatch", "22P02", Some(400)))
        } else {
            Ok(())
        }
    });

    let outcome = uploader.upload_next().await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Discarded { .. }));
    assert_eq!(db.crud_transaction_count().unwrap(), 0);

    // "c" was discarded with the transaction, not sent on its own.
    let ids: Vec<String> = connector.applied().iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, vec!["a"]);
}

// ============================================================================
// Single flight
// ============================================================================

#[tokio::test]
async fn at_most_one_upload_is_in_flight() {
    let db = open_db();
    let connector = Arc::new(MockConnector::with_delay(Duration::from_millis(10)));
    let uploader = Arc::new(Uploader::new(db.clone(), connector.clone(), fast_retry()));

    for i in 0..6 {
        insert(&db, &format!("row-{i}"), "concurrent");
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let up = Arc::clone(&uploader);
        handles.push(tokio::spawn(async move {
            loop {
                match up.upload_next().await.unwrap() {
                    UploadOutcome::Idle => break,
                    _ => continue,
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(connector.max_concurrent.load(Ordering::SeqCst), 1);
    assert_eq!(db.crud_transaction_count().unwrap(), 0);
    assert_eq!(connector.applied().len(), 6);
}

// ============================================================================
// Upload-time rewrite
// ============================================================================

#[tokio::test]
async fn owner_is_patched_at_upload_time_not_before() {
    let db = open_db();
    let connector = Arc::new(MockConnector::new());
    let uploader = Uploader::new(db.clone(), connector.clone(), fast_retry());

    // Created offline/anonymous: null owner, one queued PUT.
    insert(&db, "a", "spotted before sign-in");
    assert_eq!(db.crud_transaction_count().unwrap(), 1);

    connector.sign_in("U1");
    let outcome = uploader.upload_next().await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Completed { .. }));

    // The uploaded entry carries the owner...
    let uploaded = &connector.applied()[0];
    assert_eq!(uploaded.data.as_ref().unwrap()["user_id"], json!("U1"));

    // ...while the local row still has the null owner it was created with.
    let row = db
        .get("SELECT user_id FROM sightings WHERE id = 'a'", &[])
        .unwrap()
        .unwrap();
    assert_eq!(row["user_id"], json!(null));
    assert_eq!(db.crud_transaction_count().unwrap(), 0);
}

// ============================================================================
// Background loop
// ============================================================================

#[tokio::test]
async fn background_loop_drains_new_mutations() {
    let db = open_db();
    let connector = Arc::new(MockConnector::new());
    let uploader = Arc::new(Uploader::new(db.clone(), connector.clone(), fast_retry()));
    let task = uploader.spawn();

    insert(&db, "a", "first");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(db.crud_transaction_count().unwrap(), 0);

    insert(&db, "b", "second");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(db.crud_transaction_count().unwrap(), 0);

    let ids: Vec<String> = connector.applied().iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, vec!["a", "b"]);

    uploader.stop();
    task.await.unwrap();

    // Stopped: new mutations stay queued (and durable).
    insert(&db, "c", "after stop");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(db.crud_transaction_count().unwrap(), 1);
}
