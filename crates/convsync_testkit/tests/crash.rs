//! Write failures: rollback, poisoning and torn tails.

use convsync_core::{CoreError, EntityKind, LocalStore, PendingCounts, StoreConfig};
use convsync_testkit::prelude::*;

fn open(backend: &FaultyBackend) -> LocalStore {
    LocalStore::open_with_backend(Box::new(backend.clone()), StoreConfig::default()).unwrap()
}

#[test]
fn failed_flush_rolls_back_the_transaction() {
    let backend = FaultyBackend::new();
    let store = open(&backend);
    seed_conversation(&store, "c1", 2);
    let bytes = backend.data();
    let counts = store.pending_counts();

    backend.fail_flush(true);
    let err = store.put(sample_message("c1", 2)).unwrap_err();
    assert!(matches!(err, CoreError::Storage(_)));

    assert_eq!(backend.data(), bytes);
    assert_eq!(store.pending_counts(), counts);
    assert_eq!(store.list_by_conversation("c1").count(), 2);
    assert!(!store.is_poisoned());

    backend.heal();
    store.put(sample_message("c1", 2)).unwrap();
    assert_eq!(store.list_by_conversation("c1").count(), 3);
}

#[test]
fn cascade_delete_is_all_or_nothing() {
    let backend = FaultyBackend::new();
    let store = open(&backend);
    seed_conversation(&store, "c1", 4);

    backend.tear_next_append(20);
    assert!(store.delete(EntityKind::Conversation, "c1").is_err());
    assert_eq!(store.list_by_conversation("c1").count(), 4);
    assert_eq!(store.pending_counts().messages, 4);
    drop(store);

    let reopened =
        LocalStore::open_with_backend(Box::new(backend.survivor()), StoreConfig::default())
            .unwrap();
    assert_eq!(reopened.list_by_conversation("c1").count(), 4);
    reopened.verify().unwrap();
}

#[test]
fn failed_rollback_poisons_until_reopen() {
    let backend = FaultyBackend::new();
    let store = open(&backend);
    seed_conversation(&store, "c1", 1);

    backend.fail_truncate(true);
    backend.tear_next_append(30);
    assert!(matches!(
        store.put(sample_message("c1", 1)),
        Err(CoreError::Poisoned)
    ));
    assert!(store.is_poisoned());
    assert!(matches!(
        store.put(sample_conversation("c2")),
        Err(CoreError::Poisoned)
    ));
    // Reads keep working on the last acknowledged state
    assert_eq!(store.list_by_conversation("c1").count(), 1);
    drop(store);

    // The torn bytes are still on "disk"; reopening discards them
    backend.heal();
    let reopened = open(&backend);
    assert_eq!(reopened.list_by_conversation("c1").count(), 1);
    assert_eq!(
        reopened.pending_counts(),
        PendingCounts {
            conversations: 1,
            messages: 1,
            artifacts: 0
        }
    );
    reopened.put(sample_message("c1", 1)).unwrap();
}

#[test]
fn every_torn_prefix_recovers_to_last_commit() {
    let store = TestStore::memory();
    seed_conversation(&store, "c1", 1);
    let committed = store.raw_log();
    store.put(sample_message("c1", 1)).unwrap();
    let full = store.raw_log();
    drop(store);

    for cut in committed.len()..full.len() {
        let backend = convsync_storage::InMemoryBackend::with_data(full[..cut].to_vec());
        let reopened =
            LocalStore::open_with_backend(Box::new(backend.clone()), StoreConfig::default())
                .unwrap();
        assert_eq!(reopened.list_by_conversation("c1").count(), 1, "cut at {cut}");
        assert_eq!(backend.data(), committed, "cut at {cut}");
    }
}
