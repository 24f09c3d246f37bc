//! File-backed store behaviour across process restarts.

use convsync_core::{
    Conversation, CoreError, EntityKind, LocalStore, Message, MetaKey, RecordKey, Role,
    StoreConfig, SyncMarker,
};
use std::fs::{self, OpenOptions};
use std::io::Write;
use tempfile::tempdir;

fn seed(store: &LocalStore) {
    store.put(Conversation::new("Road trip").with_id("c1")).unwrap();
    for i in 0..5 {
        store
            .put(Message::new("c1", Role::User, format!("stop {i}")).with_id(format!("m{i}")))
            .unwrap();
    }
}

#[test]
fn reopen_preserves_entities_and_ledger() {
    let temp = tempdir().unwrap();
    {
        let store = LocalStore::open(temp.path(), StoreConfig::default()).unwrap();
        seed(&store);
        store
            .mark_synced(&RecordKey::new(EntityKind::Message, "m0"), None)
            .unwrap();
        store
            .transaction(|txn| {
                txn.set_marker(
                    &RecordKey::new(EntityKind::Message, "m1"),
                    SyncMarker::conflict("remote edited"),
                )
            })
            .unwrap();
        store.set_meta(MetaKey::LastFullSync, 1_700_000_000_000).unwrap();
    }

    let store = LocalStore::open(temp.path(), StoreConfig::default()).unwrap();
    let counts = store.pending_counts();
    assert_eq!(counts.messages, 4);
    assert_eq!(counts.conversations, 1);
    assert!(store.get_message("m0").unwrap().synced);
    assert_eq!(
        store
            .marker(&RecordKey::new(EntityKind::Message, "m1"))
            .unwrap()
            .reason,
        "remote edited"
    );
    assert_eq!(store.meta(MetaKey::LastFullSync), Some(1_700_000_000_000));

    let ids: Vec<_> = store.list_by_conversation("c1").map(|m| m.id).collect();
    assert_eq!(ids, vec!["m0", "m1", "m2", "m3", "m4"]);
    store.verify().unwrap();
}

#[test]
fn torn_tail_is_discarded_on_open() {
    let temp = tempdir().unwrap();
    let log = temp.path().join("store.log");
    {
        let store = LocalStore::open(temp.path(), StoreConfig::default()).unwrap();
        seed(&store);
    }
    let committed = fs::metadata(&log).unwrap().len();

    // A crash mid-append leaves half a record behind
    let mut file = OpenOptions::new().append(true).open(&log).unwrap();
    file.write_all(b"CSWL\x01\x00\x02\xff\xff").unwrap();
    drop(file);

    let store = LocalStore::open(temp.path(), StoreConfig::default()).unwrap();
    assert_eq!(store.list_by_conversation("c1").count(), 5);
    assert_eq!(fs::metadata(&log).unwrap().len(), committed);
}

#[test]
fn flipped_byte_fails_open() {
    let temp = tempdir().unwrap();
    let log = temp.path().join("store.log");
    {
        let store = LocalStore::open(temp.path(), StoreConfig::default()).unwrap();
        seed(&store);
    }

    // Inside the payload of the first record
    let mut bytes = fs::read(&log).unwrap();
    bytes[13] ^= 0x5A;
    fs::write(&log, bytes).unwrap();

    let err = LocalStore::open(temp.path(), StoreConfig::default()).unwrap_err();
    assert!(err.requires_reinitialization(), "unexpected error: {err}");
}

#[test]
fn destroy_resets_to_empty() {
    let temp = tempdir().unwrap();
    {
        let store = LocalStore::open(temp.path(), StoreConfig::default()).unwrap();
        seed(&store);
    }
    LocalStore::destroy(temp.path()).unwrap();

    let store = LocalStore::open(temp.path(), StoreConfig::default()).unwrap();
    assert!(store.conversations().is_empty());
    assert_eq!(store.pending_counts().total(), 0);
}

#[test]
fn second_owner_is_locked_out() {
    let temp = tempdir().unwrap();
    let _store = LocalStore::open(temp.path(), StoreConfig::default()).unwrap();
    assert!(matches!(
        LocalStore::open(temp.path(), StoreConfig::default()),
        Err(CoreError::Locked)
    ));
    assert!(matches!(
        LocalStore::destroy(temp.path()),
        Err(CoreError::Locked)
    ));
}

#[test]
fn compaction_survives_reopen() {
    let temp = tempdir().unwrap();
    let log = temp.path().join("store.log");
    {
        let store = LocalStore::open(temp.path(), StoreConfig::default()).unwrap();
        seed(&store);
        for i in 0..5 {
            store
                .mark_synced(&RecordKey::new(EntityKind::Message, format!("m{i}")), None)
                .unwrap();
        }
        let before = fs::metadata(&log).unwrap().len();
        let report = store.compact().unwrap();
        assert_eq!(report.bytes_before, before);
        assert_eq!(fs::metadata(&log).unwrap().len(), report.bytes_after);
        assert!(!temp.path().join("store.log.tmp").exists());

        // The store keeps writing to the new log
        store
            .put(Message::new("c1", Role::Assistant, "arrived").with_id("m5"))
            .unwrap();
    }

    let store = LocalStore::open(temp.path(), StoreConfig::default()).unwrap();
    assert_eq!(store.list_by_conversation("c1").count(), 6);
    assert_eq!(store.pending_counts().messages, 1);
    store.verify().unwrap();
}

#[test]
fn auto_compaction_bounds_log_growth() {
    let temp = tempdir().unwrap();
    let config = StoreConfig::default()
        .sync_on_commit(false)
        .auto_compact_bytes(4096);
    let store = LocalStore::open(temp.path(), config).unwrap();
    store.put(Conversation::new("chatty").with_id("c1")).unwrap();

    let mut title = String::new();
    for i in 0..200 {
        title = format!("revision {i}");
        store
            .put(Conversation::new(title.clone()).with_id("c1"))
            .unwrap();
    }

    assert!(store.log_bytes().unwrap() < 2 * 4096);
    assert_eq!(store.get_conversation("c1").unwrap().title, title);
}
