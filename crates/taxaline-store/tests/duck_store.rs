use std::sync::{Arc, Barrier};
use std::time::Duration;

use serde_json::json;
use taxaline_store::{
    collections, scan_batches, Document, DocumentStore, DuckStore, LockConfig, LockError,
    LockManager, LockState,
};
use tempfile::TempDir;

fn doc(id: &str, part: &str, version: &str) -> Document {
    Document::from_serializable(id, &json!({ "scientificName": format!("Taxon {id}") }))
        .unwrap()
        .with_partition(part)
        .with_version(version)
}

fn open(dir: &TempDir) -> DuckStore {
    DuckStore::open(&dir.path().join("db/taxaline.duckdb"), None).unwrap()
}

#[test]
fn upsert_counts_inserts_and_updates() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    let first = store
        .upsert_many(collections::RAW, &[doc("a", "p1", "v1"), doc("b", "p1", "v1")])
        .unwrap();
    assert_eq!((first.inserted, first.updated), (2, 0));

    let second = store
        .upsert_many(collections::RAW, &[doc("b", "p1", "v2"), doc("c", "p1", "v2")])
        .unwrap();
    assert_eq!((second.inserted, second.updated), (1, 1));

    let b = store.find_one(collections::RAW, "b").unwrap().unwrap();
    assert_eq!(b.version.as_deref(), Some("v2"));
    assert_eq!(b.get_str("scientificName"), Some("Taxon b"));
    assert!(store.find_one(collections::RAW, "zz").unwrap().is_none());
}

#[test]
fn duplicate_ids_in_one_batch_keep_last() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let s = store
        .upsert_many(collections::TAXA, &[doc("a", "p", "v1"), doc("a", "p", "v2")])
        .unwrap();
    assert_eq!(s.total(), 2);
    let a = store.find_one(collections::TAXA, "a").unwrap().unwrap();
    assert_eq!(a.version.as_deref(), Some("v2"));
    assert_eq!(store.count(collections::TAXA).unwrap(), 1);
}

#[test]
fn version_queries_and_supersession() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    store
        .upsert_many(
            collections::RAW,
            &[
                doc("a", "p1", "v1"),
                doc("b", "p1", "v2"),
                doc("c", "p2", "v1"),
            ],
        )
        .unwrap();

    let ids = store.ids_with_version(collections::RAW, "v1").unwrap();
    assert!(ids.contains("a") && ids.contains("c"));
    assert_eq!(store.count_with_version(collections::RAW, "v2").unwrap(), 1);

    let removed = store
        .delete_superseded(collections::RAW, "p1", "v2")
        .unwrap();
    assert_eq!(removed, 1);
    assert!(store.find_one(collections::RAW, "a").unwrap().is_none());
    // other partitions untouched
    assert!(store.find_one(collections::RAW, "c").unwrap().is_some());
}

#[test]
fn scan_in_id_order() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let docs: Vec<_> = (0..25)
        .map(|i| doc(&format!("id{i:03}"), "p", "v"))
        .collect();
    store.upsert_many(collections::RAW, &docs).unwrap();

    let mut seen = Vec::new();
    let mut batches = 0;
    let total = scan_batches(&store, collections::RAW, 10, |batch| {
        batches += 1;
        seen.extend(batch.into_iter().map(|d| d.id));
        Ok(true)
    })
    .unwrap();
    assert_eq!(total, 25);
    assert_eq!(batches, 3);
    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(seen, sorted);
}

#[test]
fn reopen_persists() {
    let dir = TempDir::new().unwrap();
    {
        let store = open(&dir);
        store
            .insert_one(collections::METRICS, &doc("run-1", "ingest", "v1"))
            .unwrap();
    }
    let store = open(&dir);
    assert_eq!(store.count(collections::METRICS).unwrap(), 1);
    assert!(store
        .insert_one(collections::METRICS, &doc("run-1", "ingest", "v1"))
        .is_err());
}

#[test]
fn invalid_collection_rejected() {
    let store = DuckStore::open_in_memory().unwrap();
    assert!(store.find_all("taxa; DROP TABLE x").is_err());
}

#[test]
fn concurrent_acquire_has_one_winner() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store: Arc<dyn DocumentStore> = Arc::new(DuckStore::open_in_memory().unwrap());
    let locks = Arc::new(LockManager::new(
        store,
        LockConfig {
            ttl: Duration::from_secs(60),
        },
    ));

    let n = 8;
    let barrier = Arc::new(Barrier::new(n));
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let locks = Arc::clone(&locks);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                locks.acquire("ingest:p1", false)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, LockError::Held { .. })));

    locks.release(winners[0], Ok(())).unwrap();
    let again = locks.acquire("ingest:p1", false).unwrap();
    assert_ne!(again.holder_id, winners[0].holder_id);

    let listed = locks.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].state, LockState::Running);
}
