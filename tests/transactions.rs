//! Transaction semantics: rollback, nesting errors, and parallel writers.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use common::*;
use novusdb::{Database, NovusError, PagerConfig, Statement};
use tempfile::tempdir;

fn open_fast(path: std::path::PathBuf) -> Database {
    init_logging();
    let config = PagerConfig {
        fsync_on_commit: false,
        ..PagerConfig::default()
    };
    Database::open_with(path, config).unwrap()
}

#[test]
fn rollback_discards_writes_and_index_entries() {
    let tmp = tempdir().unwrap();
    let db = open_fast(tmp.path().join("txn.db"));

    db.execute(insert_row("jobs", vec![("type", lit("keep"))])).unwrap();
    db.execute(create_index("jobs", "type")).unwrap();
    let free_before = db.stats().unwrap().free_pages;

    db.execute(Statement::Begin).unwrap();
    for n in 0..10i64 {
        db.execute(insert_row(
            "jobs",
            vec![("type", lit("rollback_me")), ("n", lit(n))],
        ))
        .unwrap();
    }
    // The transaction sees its own writes.
    let visible = db
        .execute(select_where("jobs", eq("type", "rollback_me")))
        .unwrap();
    assert_eq!(visible.docs.unwrap().len(), 10);
    db.execute(Statement::Rollback).unwrap();

    // Collection size unchanged, no leaked index entries, free list intact
    // or grown.
    let all = db.execute(select_all("jobs")).unwrap();
    assert_eq!(all.docs.unwrap().len(), 1);
    let by_index = db
        .execute(select_where("jobs", eq("type", "rollback_me")))
        .unwrap();
    assert!(by_index.docs.unwrap().is_empty());
    assert!(db.stats().unwrap().free_pages >= free_before);

    // The id counter also rolled back.
    let result = db
        .execute(insert_row("jobs", vec![("type", lit("next"))]))
        .unwrap();
    assert_eq!(result.last_insert_id, 2);
}

#[test]
fn commit_makes_writes_durable_and_visible() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("txn.db");
    {
        let db = Database::open(&path).unwrap();
        db.execute(Statement::Begin).unwrap();
        db.execute(insert_row("jobs", vec![("n", lit(1i64))])).unwrap();
        db.execute(insert_row("jobs", vec![("n", lit(2i64))])).unwrap();
        db.execute(Statement::Commit).unwrap();
        db.close().unwrap();
    }
    let db = Database::open(&path).unwrap();
    assert_eq!(db.execute(select_all("jobs")).unwrap().docs.unwrap().len(), 2);
}

#[test]
fn nested_begin_and_stray_commit_are_errors() {
    let tmp = tempdir().unwrap();
    let db = open_fast(tmp.path().join("txn.db"));

    assert!(matches!(
        db.execute(Statement::Commit),
        Err(NovusError::Transaction(_))
    ));
    assert!(matches!(
        db.execute(Statement::Rollback),
        Err(NovusError::Transaction(_))
    ));

    db.execute(Statement::Begin).unwrap();
    assert!(matches!(
        db.execute(Statement::Begin),
        Err(NovusError::Transaction(_))
    ));
    db.execute(Statement::Rollback).unwrap();
}

#[test]
fn failed_statement_aborts_its_autocommit_txn() {
    let tmp = tempdir().unwrap();
    let db = open_fast(tmp.path().join("txn.db"));
    db.execute(insert_row("jobs", vec![("n", lit(1i64))])).unwrap();

    // Unknown sequence fails after the row evaluation begins; nothing of the
    // statement survives.
    let bad = insert_row(
        "jobs",
        vec![("n", lit(2i64)), ("id", novusdb::Expr::SeqNext("nope".into()))],
    );
    assert!(matches!(db.execute(bad), Err(NovusError::Schema(_))));

    let all = db.execute(select_all("jobs")).unwrap();
    assert_eq!(all.docs.unwrap().len(), 1);
}

#[test]
fn parallel_writers_produce_unique_monotonic_ids() {
    let tmp = tempdir().unwrap();
    let db = Arc::new(open_fast(tmp.path().join("bench.db")));

    let mut handles = Vec::new();
    for worker in 0..10 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            let mut ids = Vec::with_capacity(100);
            for n in 0..100i64 {
                let result = db
                    .execute(insert_row(
                        "bench",
                        vec![("worker", lit(worker as i64)), ("n", lit(n))],
                    ))
                    .unwrap();
                ids.push(result.last_insert_id);
            }
            ids
        }));
    }

    let mut all_ids: Vec<u64> = Vec::new();
    for handle in handles {
        let ids = handle.join().unwrap();
        // Each worker observes strictly increasing ids.
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        all_ids.extend(ids);
    }

    let unique: HashSet<u64> = all_ids.iter().copied().collect();
    assert_eq!(unique.len(), 1000);
    assert_eq!(all_ids.iter().copied().max(), Some(1000));

    let count = db.execute(select_all("bench")).unwrap();
    assert_eq!(count.docs.unwrap().len(), 1000);
}

#[test]
fn statements_on_any_thread_join_the_open_transaction() {
    let tmp = tempdir().unwrap();
    let db = Arc::new(open_fast(tmp.path().join("txn.db")));
    db.execute(insert_row("jobs", vec![("n", lit(1i64))])).unwrap();

    db.execute(Statement::Begin).unwrap();
    db.execute(insert_row("jobs", vec![("n", lit(2i64))])).unwrap();

    // The handle has one transaction context; a SELECT from another thread
    // runs inside it and observes its writes.
    let reader = {
        let db = Arc::clone(&db);
        thread::spawn(move || db.execute(select_all("jobs")).unwrap().docs.unwrap().len())
    };
    assert_eq!(reader.join().unwrap(), 2);

    db.execute(Statement::Rollback).unwrap();
    assert_eq!(db.execute(select_all("jobs")).unwrap().docs.unwrap().len(), 1);
}
