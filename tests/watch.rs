//! Live-query subscription semantics.

use std::sync::Arc;

use footprint_db::db::{Database, WatchOptions};
use footprint_db::schema::{Column, Schema, Table};
use footprint_db::types::{RemoteChange, RemoteOp};
use parking_lot::Mutex;
use serde_json::{json, Value};

fn open_db() -> Database {
    let schema = Schema::new(vec![Table::new("sightings")
        .column(Column::text("comments"))
        .column(Column::text("photo_id"))]);
    Database::open_in_memory(schema).unwrap()
}

/// Collects every result set a watch callback delivers.
#[derive(Clone, Default)]
struct ResultLog {
    results: Arc<Mutex<Vec<Vec<Value>>>>,
}

impl ResultLog {
    fn callback(&self) -> impl Fn(&[Value]) + Send + Sync + 'static {
        let results = Arc::clone(&self.results);
        move |rows| results.lock().push(rows.to_vec())
    }

    fn len(&self) -> usize {
        self.results.lock().len()
    }

    fn last(&self) -> Vec<Value> {
        self.results.lock().last().cloned().unwrap_or_default()
    }
}

#[test]
fn watch_fires_immediately_with_current_result() {
    let db = open_db();
    db.execute("INSERT INTO sightings (id, comments) VALUES ('a', 'hello')", &[])
        .unwrap();

    let log = ResultLog::default();
    let _handle = db
        .watch("SELECT id FROM sightings ORDER BY id", &[], WatchOptions::default(), log.callback())
        .unwrap();

    assert_eq!(log.len(), 1);
    assert_eq!(log.last(), vec![json!({"id": "a"})]);
}

#[test]
fn watch_fires_after_each_relevant_commit() {
    let db = open_db();
    let log = ResultLog::default();
    let _handle = db
        .watch("SELECT id FROM sightings ORDER BY id", &[], WatchOptions::default(), log.callback())
        .unwrap();
    assert_eq!(log.len(), 1);

    db.execute("INSERT INTO sightings (id) VALUES ('a')", &[]).unwrap();
    db.execute("INSERT INTO sightings (id) VALUES ('b')", &[]).unwrap();

    assert_eq!(log.len(), 3);
    assert_eq!(log.last(), vec![json!({"id": "a"}), json!({"id": "b"})]);
}

#[test]
fn remote_merges_also_notify_watchers() {
    let db = open_db();
    let log = ResultLog::default();
    let _handle = db
        .watch("SELECT id FROM sightings", &[], WatchOptions::default(), log.callback())
        .unwrap();

    db.apply_remote_changes(&[RemoteChange {
        table: "sightings".to_string(),
        id: "r1".to_string(),
        op: RemoteOp::Upsert,
        data: Some(json!({"comments": "from the server", "photo_id": null})),
    }])
    .unwrap();

    assert_eq!(log.len(), 2);
    assert_eq!(log.last()[0]["id"], json!("r1"));
}

#[test]
fn no_callback_after_unsubscribe() {
    let db = open_db();
    let log = ResultLog::default();
    let handle = db
        .watch("SELECT id FROM sightings", &[], WatchOptions::default(), log.callback())
        .unwrap();

    handle.unsubscribe();
    db.execute("INSERT INTO sightings (id) VALUES ('a')", &[]).unwrap();
    assert_eq!(log.len(), 1);
}

#[test]
fn dropping_the_handle_unsubscribes() {
    let db = open_db();
    let log = ResultLog::default();
    {
        let _handle = db
            .watch("SELECT id FROM sightings", &[], WatchOptions::default(), log.callback())
            .unwrap();
    }
    db.execute("INSERT INTO sightings (id) VALUES ('a')", &[]).unwrap();
    assert_eq!(log.len(), 1);
}

#[test]
fn explicit_table_list_filters_unrelated_changes() {
    let db = open_db();
    let log = ResultLog::default();
    let _handle = db
        .watch(
            "SELECT id, state FROM fp_attachments",
            &[],
            WatchOptions::tables(["fp_attachments"]),
            log.callback(),
        )
        .unwrap();
    assert_eq!(log.len(), 1);

    // Writes to user tables do not re-run the attachment watch.
    db.execute("INSERT INTO sightings (id) VALUES ('a')", &[]).unwrap();
    assert_eq!(log.len(), 1);

    db.execute(
        "INSERT INTO fp_attachments (id, filename, state, has_local, updated_at) \
         VALUES ('p1', 'p1.jpeg', 0, 1, '2026-08-01T00:00:00Z')",
        &[],
    )
    .unwrap();
    assert_eq!(log.len(), 2);
}

#[test]
fn watch_with_params_rebinds_on_each_run() {
    let db = open_db();
    let log = ResultLog::default();
    let _handle = db
        .watch(
            "SELECT id FROM sightings WHERE comments = ?1",
            &[json!("match")],
            WatchOptions::default(),
            log.callback(),
        )
        .unwrap();

    db.execute("INSERT INTO sightings (id, comments) VALUES ('a', 'other')", &[])
        .unwrap();
    db.execute("INSERT INTO sightings (id, comments) VALUES ('b', 'match')", &[])
        .unwrap();

    assert_eq!(log.len(), 3);
    assert_eq!(log.last(), vec![json!({"id": "b"})]);
}
