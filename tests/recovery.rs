//! Durability: committed writes survive a crash before the data-file flush;
//! uncommitted writes never surface.

mod common;

use common::*;
use novusdb::{Database, PagerConfig, Statement, Value};
use tempfile::tempdir;

fn lazy_config() -> PagerConfig {
    // No commit-time flush: committed pages stay dirty in the cache and the
    // WAL is the only durable copy.
    PagerConfig {
        fsync_on_commit: false,
        ..PagerConfig::default()
    }
}

/// Simulate `kill -9`: leak the handle so no destructor flushes anything.
fn crash(db: Database) {
    std::mem::forget(db);
}

#[test]
fn committed_writes_survive_crash_before_flush() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("crash.db");
    let wal_path = tmp.path().join("crash.db.wal");

    {
        let db = Database::open_with(&path, lazy_config()).unwrap();
        db.execute(Statement::Begin).unwrap();
        for n in 0..100i64 {
            db.execute(insert_row("docs", vec![("n", lit(n))])).unwrap();
        }
        db.execute(Statement::Commit).unwrap();
        assert!(std::fs::metadata(&wal_path).unwrap().len() > 0);
        crash(db);
    }

    let db = Database::open_with(&path, lazy_config()).unwrap();
    let result = db.execute(select_all("docs")).unwrap();
    let docs = result.docs.unwrap();
    assert_eq!(docs.len(), 100);
    let ns: Vec<i64> = docs
        .iter()
        .map(|d| d.get("n").and_then(|v| v.as_int()).unwrap())
        .collect();
    assert_eq!(ns, (0..100).collect::<Vec<i64>>());

    // Recovery checkpointed: the WAL is truncated back to its header.
    assert!(std::fs::metadata(&wal_path).unwrap().len() < 64);
    // And the reopened handle starts with a fresh cache.
    let stats = db.cache_stats();
    assert_eq!(stats.capacity, 1024);
}

#[test]
fn uncommitted_writes_do_not_survive() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("crash.db");

    {
        let db = Database::open_with(&path, lazy_config()).unwrap();
        db.execute(insert_row("docs", vec![("keep", lit(1i64))]))
            .unwrap();
        db.execute(Statement::Begin).unwrap();
        for n in 0..10i64 {
            db.execute(insert_row("docs", vec![("n", lit(n))])).unwrap();
        }
        // No COMMIT.
        crash(db);
    }

    let db = Database::open_with(&path, lazy_config()).unwrap();
    let result = db.execute(select_all("docs")).unwrap();
    let docs = result.docs.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].get("keep"), Some(&Value::Int(1)));
}

#[test]
fn repeated_crashes_recover_idempotently() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("crash.db");

    {
        let db = Database::open_with(&path, lazy_config()).unwrap();
        db.execute(insert_row("docs", vec![("n", lit(1i64))])).unwrap();
        crash(db);
    }
    for _ in 0..3 {
        let db = Database::open_with(&path, lazy_config()).unwrap();
        let result = db.execute(select_all("docs")).unwrap();
        assert_eq!(result.docs.unwrap().len(), 1);
        crash(db);
    }
}

#[test]
fn default_config_flushes_at_commit() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("sync.db");
    let wal_path = tmp.path().join("sync.db.wal");

    let db = Database::open(&path).unwrap();
    db.execute(insert_row("docs", vec![("n", lit(1i64))])).unwrap();
    // Commit-time checkpoint truncated the log.
    assert!(std::fs::metadata(&wal_path).unwrap().len() < 64);
    crash(db);

    let db = Database::open(&path).unwrap();
    assert_eq!(db.execute(select_all("docs")).unwrap().docs.unwrap().len(), 1);
}

#[test]
fn indexes_survive_recovery() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("crash.db");

    {
        let db = Database::open_with(&path, lazy_config()).unwrap();
        for t in ["a", "b", "a"] {
            db.execute(insert_row("jobs", vec![("type", lit(t))])).unwrap();
        }
        db.execute(create_index("jobs", "type")).unwrap();
        crash(db);
    }

    let db = Database::open_with(&path, lazy_config()).unwrap();
    assert_eq!(db.list_indexes().len(), 1);
    let result = db
        .execute(select_where("jobs", eq("type", "a")))
        .unwrap();
    assert_eq!(result.docs.unwrap().len(), 2);
}
