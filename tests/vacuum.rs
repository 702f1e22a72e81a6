//! Vacuum: tombstone reclamation, index rebuild, idempotence.

mod common;

use common::*;
use novusdb::{Database, PagerConfig};
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
fn vacuum_reclaims_tombstones_once() {
    let tmp = tempdir().unwrap();
    let db = open_fast(tmp.path().join("vac.db"));

    for n in 0..100i64 {
        db.execute(insert_row(
            "jobs",
            vec![("n", lit(n)), ("bucket", lit(n % 4))],
        ))
        .unwrap();
    }
    db.execute(create_index("jobs", "bucket")).unwrap();
    db.execute(delete("jobs", Some(eq("bucket", 0i64)))).unwrap();

    let before: Vec<i64> = db
        .execute(select_all("jobs"))
        .unwrap()
        .docs
        .unwrap()
        .iter()
        .map(|d| d.get("n").and_then(|v| v.as_int()).unwrap())
        .collect();
    assert_eq!(before.len(), 75);

    let reclaimed = db.vacuum().unwrap();
    assert_eq!(reclaimed, 25);

    // Identical results before and after, through both scan and index.
    let after: Vec<i64> = db
        .execute(select_all("jobs"))
        .unwrap()
        .docs
        .unwrap()
        .iter()
        .map(|d| d.get("n").and_then(|v| v.as_int()).unwrap())
        .collect();
    assert_eq!(before, after);

    let by_index = db
        .execute(select_where("jobs", eq("bucket", 1i64)))
        .unwrap();
    assert_eq!(by_index.docs.unwrap().len(), 25);
    let gone = db
        .execute(select_where("jobs", eq("bucket", 0i64)))
        .unwrap();
    assert!(gone.docs.unwrap().is_empty());

    // Second vacuum reclaims nothing.
    assert_eq!(db.vacuum().unwrap(), 0);
}

#[test]
fn vacuum_returns_pages_to_the_free_list() {
    let tmp = tempdir().unwrap();
    let db = open_fast(tmp.path().join("vac.db"));

    let filler = "x".repeat(400);
    for n in 0..200i64 {
        db.execute(insert_row(
            "bulk",
            vec![("n", lit(n)), ("pad", lit(filler.as_str()))],
        ))
        .unwrap();
    }
    db.execute(delete("bulk", None)).unwrap();

    let before = db.stats().unwrap();
    let reclaimed = db.vacuum().unwrap();
    assert_eq!(reclaimed, 200);
    let after = db.stats().unwrap();
    assert!(after.free_pages > before.free_pages);
    assert_eq!(
        after.collections,
        vec![novusdb::CollectionStats {
            name: "bulk".to_string(),
            records: 0
        }]
    );
}

#[test]
fn vacuum_preserves_record_ids() {
    let tmp = tempdir().unwrap();
    let db = open_fast(tmp.path().join("vac.db"));

    for n in 0..10i64 {
        db.execute(insert_row("jobs", vec![("n", lit(n))])).unwrap();
    }
    db.execute(delete("jobs", Some(eq("n", 0i64)))).unwrap();
    db.vacuum().unwrap();

    // New inserts continue the id sequence; vacuum never reuses ids.
    let result = db
        .execute(insert_row("jobs", vec![("n", lit(99i64))]))
        .unwrap();
    assert_eq!(result.last_insert_id, 11);

    let count = db.execute(select_all("jobs")).unwrap();
    assert_eq!(count.docs.unwrap().len(), 10);
}
