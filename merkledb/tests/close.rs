mod common;

use common::new_db;
use merkledb::{Error, ViewChanges};

#[test]
fn closed_database_refuses_operations() {
    let db = new_db();
    db.insert(b"a", b"1").unwrap();
    db.close().unwrap();

    assert_eq!(db.get(b"a"), Err(Error::Closed));
    assert_eq!(db.insert(b"b", b"2"), Err(Error::Closed));
    assert_eq!(db.new_view(ViewChanges::new()).err(), Some(Error::Closed));
    assert_eq!(db.iterator().err(), Some(Error::Closed));
    assert_eq!(db.close(), Err(Error::Closed));
}

#[test]
fn close_tolerates_leaked_iterators() {
    let db = new_db();
    db.insert(b"a", b"1").unwrap();
    let iter = db.iterator().unwrap();
    // closing with the iterator still alive warns but succeeds
    db.close().unwrap();
    assert_eq!(iter.count(), 1);
}

#[test]
fn views_fail_once_the_database_closes() {
    let db = new_db();
    db.insert(b"a", b"1").unwrap();
    let view = db
        .new_view(ViewChanges::new().put(&b"b"[..], &b"2"[..]))
        .unwrap();
    db.close().unwrap();

    assert_eq!(view.commit_to_db(), Err(Error::Closed));
    // reads of pending changes still work from memory; reads that fall
    // through to the store report the closed database
    assert_eq!(view.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(view.get(b"a"), Err(Error::Closed));
}

#[test]
fn compact_resolves_bounds() {
    let db = new_db();
    db.compact(&[], None).unwrap();
    db.insert(b"a", b"1").unwrap();
    db.compact(&[], None).unwrap();
    db.compact(b"a", Some(b"b")).unwrap();
    // start at or past the limit: no-op
    db.compact(b"b", Some(b"b")).unwrap();
    db.compact(b"c", Some(b"b")).unwrap();
}

#[test]
fn metrics_observe_activity() {
    use merkledb::{MemoryStore, Metrics, MerkleDb, Options};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    let mut options = Options::new();
    options.metrics(true);
    let db = MerkleDb::open(Arc::new(MemoryStore::new()), options).unwrap();
    db.insert(b"a", b"1").unwrap();
    db.insert(b"ab", b"2").unwrap();
    db.get(b"a").unwrap();

    match db.metrics() {
        Metrics::Active(metrics) => {
            assert_eq!(metrics.commits.load(Ordering::Relaxed), 2);
            assert!(metrics.nodes_hashed.load(Ordering::Relaxed) >= 4);
        }
        Metrics::Inactive => panic!("metrics were enabled"),
    }
}
