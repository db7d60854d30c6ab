//! Transaction-Id Store Tests
//!
//! Insertion-order iteration, resumable and tail cursors, recovery after
//! reopening, and the write-without-update guard, over both persistence
//! backends.

use assert_matches::assert_matches;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use viewmesh_core::{ValidationCode, ViewMeshError};
use viewmesh_store::{
    FilePersistence, MemoryPersistence, Persistence, SeekPosition, TxIdIterator, TxIdStore,
};

const FIRST_BATCH: [&str; 8] = [
    "txid1", "txid2", "txid10", "txid12", "txid21", "txid100", "txid200", "txid1025",
];

fn drain(mut it: TxIdIterator) -> Vec<String> {
    let mut txids = Vec::new();
    while let Some(entry) = it.next().unwrap() {
        txids.push(entry.txid);
    }
    it.close();
    txids
}

fn commit_all(store: &TxIdStore, txids: &[&str], code: ValidationCode) {
    store.begin_update().unwrap();
    for txid in txids {
        store.set(txid, code).unwrap();
    }
    store.commit().unwrap();
}

fn first_session(store: &TxIdStore) {
    let mut tail = store.iterator(SeekPosition::End).unwrap();
    assert!(tail.next().unwrap().is_none());

    commit_all(store, &FIRST_BATCH, ValidationCode::Valid);

    assert_eq!(store.get("txid3").unwrap(), ValidationCode::Unknown);
    assert_eq!(store.get("txid10").unwrap(), ValidationCode::Valid);

    assert_eq!(drain(store.iterator(SeekPosition::End).unwrap()), ["txid1025"]);
    assert_eq!(drain(store.iterator(SeekPosition::Start).unwrap()), FIRST_BATCH);

    let err = store
        .iterator(SeekPosition::At("boh".to_string()))
        .err()
        .unwrap();
    assert_matches!(err, ViewMeshError::NotFound { .. });
    assert_eq!(err.message(), "txid boh was not found");

    assert_eq!(
        drain(store.iterator(SeekPosition::At("txid12".to_string())).unwrap()),
        ["txid12", "txid21", "txid100", "txid200", "txid1025"]
    );
}

fn second_session(store: &TxIdStore) {
    commit_all(store, &["txid3"], ValidationCode::Valid);
    assert_eq!(store.get("txid3").unwrap(), ValidationCode::Valid);

    let mut expected: Vec<&str> = FIRST_BATCH.to_vec();
    expected.push("txid3");
    assert_eq!(drain(store.iterator(SeekPosition::Start).unwrap()), expected);
    assert_eq!(drain(store.iterator(SeekPosition::End).unwrap()), ["txid3"]);
    assert_eq!(store.get_last_tx_id().as_deref(), Some("txid3"));
}

#[test]
fn memory_store_orders_by_insertion_and_recovers() {
    let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
    first_session(&TxIdStore::new(persistence.clone()).unwrap());
    second_session(&TxIdStore::new(persistence).unwrap());
}

#[test]
fn file_store_orders_by_insertion_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("txids.bin");

    {
        let persistence = Arc::new(FilePersistence::open(&path).unwrap());
        first_session(&TxIdStore::new(persistence.clone()).unwrap());
        persistence.close().unwrap();
    }
    let persistence = Arc::new(FilePersistence::open(&path).unwrap());
    second_session(&TxIdStore::new(persistence).unwrap());
}

#[test]
#[should_panic(expected = "programming error, writing without ongoing update")]
fn set_without_update_panics() {
    let store = TxIdStore::new(Arc::new(MemoryPersistence::new())).unwrap();
    let _ = store.set("txid1", ValidationCode::Valid);
}

#[test]
fn set_after_commit_panics_again() {
    let store = TxIdStore::new(Arc::new(MemoryPersistence::new())).unwrap();
    commit_all(&store, &["txid1"], ValidationCode::Valid);
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = store.set("txid2", ValidationCode::Valid);
    }));
    assert!(outcome.is_err());
    assert_eq!(store.get("txid2").unwrap(), ValidationCode::Unknown);
}

#[test]
fn discarded_update_releases_sequence() {
    let store = TxIdStore::new(Arc::new(MemoryPersistence::new())).unwrap();
    commit_all(&store, &["a"], ValidationCode::Valid);

    store.begin_update().unwrap();
    store.set("dropped", ValidationCode::Valid).unwrap();
    store.discard().unwrap();
    assert_eq!(store.get_last_tx_id().as_deref(), Some("a"));

    commit_all(&store, &["b"], ValidationCode::Valid);
    let mut it = store.iterator(SeekPosition::Start).unwrap();
    let positions: Vec<(String, u64)> = std::iter::from_fn(|| it.next().unwrap())
        .map(|e| (e.txid, e.pos))
        .collect();
    assert_eq!(positions, [("a".to_string(), 1), ("b".to_string(), 2)]);
    assert_eq!(store.get("dropped").unwrap(), ValidationCode::Unknown);
}

#[test]
fn tail_cursor_sees_later_commits() {
    let store = TxIdStore::new(Arc::new(MemoryPersistence::new())).unwrap();
    commit_all(&store, &["a", "b"], ValidationCode::Valid);

    let mut tail = store.iterator(SeekPosition::End).unwrap();
    assert_eq!(tail.next().unwrap().unwrap().txid, "b");
    assert!(tail.next().unwrap().is_none());

    store.begin_update().unwrap();
    store.set("c", ValidationCode::Busy).unwrap();
    assert!(tail.next().unwrap().is_none());
    store.commit().unwrap();

    let entry = tail.next().unwrap().unwrap();
    assert_eq!((entry.txid.as_str(), entry.code), ("c", ValidationCode::Busy));
    assert!(tail.next().unwrap().is_none());
}

#[test]
fn concurrent_update_is_rejected() {
    let store = TxIdStore::new(Arc::new(MemoryPersistence::new())).unwrap();
    store.begin_update().unwrap();
    assert_matches!(store.begin_update(), Err(ViewMeshError::Storage { .. }));
    store.set("a", ValidationCode::Valid).unwrap();
    store.commit().unwrap();
    assert_eq!(store.get("a").unwrap(), ValidationCode::Valid);
}

proptest! {
    #[test]
    fn start_cursor_replays_insertion_order(
        txids in proptest::collection::vec("[a-z0-9]{1,12}", 1..60),
        batch in 1usize..8,
    ) {
        let mut seen = BTreeSet::new();
        let distinct: Vec<String> = txids.into_iter().filter(|t| seen.insert(t.clone())).collect();

        let store = TxIdStore::new(Arc::new(MemoryPersistence::new())).unwrap();
        for chunk in distinct.chunks(batch) {
            store.begin_update().unwrap();
            for txid in chunk {
                store.set(txid, ValidationCode::Valid).unwrap();
            }
            store.commit().unwrap();
        }

        prop_assert_eq!(drain(store.iterator(SeekPosition::Start).unwrap()), distinct.clone());
        prop_assert_eq!(store.get_last_tx_id(), distinct.last().cloned());
    }
}
