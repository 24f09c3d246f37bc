//! End-to-end behaviour of the engine facade.

use convsync::{
    Conversation, CoordinatorState, Engine, EngineConfig, EngineError, EntityKind,
    MarkSyncedOutcome, MarkerKind, Message, MockRemote, RecordKey, Role, SubmitOutcome,
    SyncStatus,
};
use convsync_testkit::{sample_artifact, sample_conversation, sample_message};
use std::sync::Arc;
use std::time::Duration;

fn engine() -> (Engine<MockRemote>, Arc<MockRemote>) {
    let remote = Arc::new(MockRemote::new());
    let engine = Engine::with_shared_remote(EngineConfig::in_memory(), Arc::clone(&remote));
    (engine, remote)
}

async fn ready() -> (Engine<MockRemote>, Arc<MockRemote>) {
    let (engine, remote) = engine();
    engine.initialize().await.unwrap();
    (engine, remote)
}

async fn wait_for(
    engine: &Engine<MockRemote>,
    what: &str,
    condition: impl Fn(&SyncStatus) -> bool,
) -> SyncStatus {
    for _ in 0..2_000 {
        let status = engine.get_sync_status().await.unwrap();
        if condition(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn operations_before_initialize_fail() {
    let (engine, _) = engine();
    assert!(!engine.is_initialized());
    assert!(matches!(
        engine.save_conversation(sample_conversation("c1")).await,
        Err(EngineError::NotInitialized)
    ));
    assert!(matches!(engine.get_conversations().await, Err(EngineError::NotInitialized)));
    assert!(matches!(engine.get_sync_status().await, Err(EngineError::NotInitialized)));
    assert!(matches!(engine.trigger_sync(), Err(EngineError::NotInitialized)));
    assert!(matches!(engine.connectivity_signal(), Err(EngineError::NotInitialized)));
    assert!(matches!(
        engine.mark_as_synced(EntityKind::Message, "m1").await,
        Err(EngineError::NotInitialized)
    ));
}

#[tokio::test]
async fn initialize_is_idempotent() {
    let (engine, _) = ready().await;
    engine.save_conversation(sample_conversation("c1")).await.unwrap();
    engine.initialize().await.unwrap();
    assert!(engine.get_conversation("c1").await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn offline_save_then_online_drain() {
    let (engine, remote) = ready().await;
    engine.save_conversation(sample_conversation("c1")).await.unwrap();
    engine.save_message(sample_message("c1", 0)).await.unwrap();
    engine.save_message(sample_message("c1", 1)).await.unwrap();

    let status = engine.get_sync_status().await.unwrap();
    assert_eq!(status.pending_messages, 2);
    assert_eq!(status.pending_conversations, 1);
    assert!(!status.is_online);
    assert!(status.last_full_sync.is_none());
    assert_eq!(remote.submit_count(), 0);

    engine.connectivity_signal().unwrap().report(true);
    let status = wait_for(&engine, "drain", |s| s.is_settled() && s.last_full_sync.is_some()).await;

    assert!(status.is_online);
    assert_eq!(status.coordinator_state, CoordinatorState::Idle);
    assert_eq!(remote.submit_count(), 3);
    for message in engine.get_messages_by_conversation_id("c1").await.unwrap() {
        assert!(message.synced);
    }
}

#[tokio::test]
async fn saves_are_always_pending() {
    let (engine, _) = ready().await;
    let mut conversation = sample_conversation("c1");
    conversation.synced = true;
    engine.save_conversation(conversation).await.unwrap();

    let stored = engine.get_conversation("c1").await.unwrap().unwrap();
    assert!(!stored.synced);
    assert_eq!(engine.get_sync_status().await.unwrap().pending_conversations, 1);
}

#[tokio::test]
async fn dangling_message_is_an_integrity_error() {
    let (engine, _) = ready().await;
    let err = engine
        .save_message(Message::new("missing", Role::User, "hello"))
        .await
        .unwrap_err();
    assert!(err.is_integrity());
    assert_eq!(engine.get_sync_status().await.unwrap().pending_total(), 0);
}

#[tokio::test]
async fn messages_keep_insertion_order() {
    let (engine, _) = ready().await;
    engine.save_conversation(sample_conversation("c1")).await.unwrap();
    // Timestamps deliberately out of order.
    for index in [3, 0, 2, 1] {
        engine.save_message(sample_message("c1", index)).await.unwrap();
    }

    let ids: Vec<String> = engine
        .get_messages_by_conversation_id("c1")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec!["c1-m3", "c1-m0", "c1-m2", "c1-m1"]);
    assert!(engine.get_messages_by_conversation_id("nope").await.unwrap().is_empty());
}

#[tokio::test]
async fn conversations_most_recent_first() {
    let (engine, _) = ready().await;
    engine.save_conversation(sample_conversation("old")).await.unwrap();
    engine.save_conversation(sample_conversation("new")).await.unwrap();
    engine.save_conversation(sample_conversation("newer")).await.unwrap();
    // A new message touches its conversation.
    engine.save_message(sample_message("old", 0)).await.unwrap();

    let ids: Vec<String> = engine
        .get_conversations()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids[0], "old");
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn round_trip_each_kind() {
    let (engine, _) = ready().await;
    let conversation = sample_conversation("c1").with_personality("tutor");
    engine.save_conversation(conversation.clone()).await.unwrap();
    let message = sample_message("c1", 1);
    engine.save_message(message.clone()).await.unwrap();
    let artifact = sample_artifact("a1");
    engine.save_artifact(artifact.clone()).await.unwrap();

    assert_eq!(engine.get_message("c1-m1").await.unwrap(), Some(message));
    assert_eq!(engine.get_artifact("a1").await.unwrap(), Some(artifact.clone()));
    assert_eq!(engine.get_artifacts().await.unwrap(), vec![artifact]);
    let stored = engine.get_conversation("c1").await.unwrap().unwrap();
    assert_eq!(stored.personality_id.as_deref(), Some("tutor"));
    assert_eq!(stored.message_ids, vec!["c1-m1".to_string()]);
    assert!(engine.get_message("absent").await.unwrap().is_none());
}

#[tokio::test]
async fn cascade_delete() {
    let (engine, _) = ready().await;
    engine.save_conversation(sample_conversation("c1")).await.unwrap();
    engine.save_message(sample_message("c1", 0)).await.unwrap();
    engine.save_message(sample_message("c1", 1)).await.unwrap();
    engine.save_artifact(sample_artifact("a1")).await.unwrap();

    assert!(engine.delete_conversation("c1").await.unwrap());
    assert!(engine.get_message("c1-m0").await.unwrap().is_none());
    assert!(!engine.delete_conversation("c1").await.unwrap());

    let status = engine.get_sync_status().await.unwrap();
    assert_eq!((status.pending_conversations, status.pending_messages), (0, 0));
    assert_eq!(status.pending_artifacts, 1);
}

#[tokio::test]
async fn mark_as_synced_contract() {
    let (engine, _) = ready().await;
    engine.save_artifact(sample_artifact("a1")).await.unwrap();

    assert_eq!(
        engine.mark_as_synced(EntityKind::Artifact, "a1").await.unwrap(),
        MarkSyncedOutcome::Synced
    );
    assert_eq!(
        engine.mark_as_synced(EntityKind::Artifact, "a1").await.unwrap(),
        MarkSyncedOutcome::AlreadySynced
    );
    assert_eq!(engine.get_sync_status().await.unwrap().pending_artifacts, 0);

    let err = engine.mark_as_synced(EntityKind::Artifact, "ghost").await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownRecord(key) if key.id == "ghost"));

    // A local edit makes it pending again.
    let mut edited = sample_artifact("a1");
    edited.title = "renamed".into();
    engine.save_artifact(edited).await.unwrap();
    assert_eq!(engine.get_sync_status().await.unwrap().pending_artifacts, 1);
}

#[tokio::test(start_paused = true)]
async fn conflicts_surface_and_resolve() {
    let (engine, remote) = ready().await;
    let key = RecordKey::new(EntityKind::Conversation, "c1");
    remote.respond_to(
        key.clone(),
        SubmitOutcome::Conflict {
            reason: "renamed on another device".into(),
        },
    );
    engine.save_conversation(sample_conversation("c1")).await.unwrap();
    engine.connectivity_signal().unwrap().report(true);

    let status = wait_for(&engine, "conflict", |s| !s.conflicts.is_empty()).await;
    assert_eq!(status.conflicts[0].key, key);
    assert_eq!(status.conflicts[0].kind, MarkerKind::Conflict);
    assert_eq!(status.pending_conversations, 1);

    assert!(matches!(
        engine.resolve_conflict(EntityKind::Artifact, "nothing").await,
        Err(EngineError::UnknownRecord(_))
    ));
    remote.clear_response(&key);
    assert!(engine.resolve_conflict(EntityKind::Conversation, "c1").await.unwrap());

    let status = wait_for(&engine, "resolution", |s| s.is_settled()).await;
    assert!(status.conflicts.is_empty());
    assert!(remote.submissions().last().unwrap().overwrite);
    assert!(!engine.resolve_conflict(EntityKind::Conversation, "c1").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn transient_failures_stay_internal() {
    let (engine, remote) = ready().await;
    remote.fail_next(1);
    engine.connectivity_signal().unwrap().report(true);
    tokio::time::sleep(Duration::from_secs(3)).await;

    engine.save_artifact(sample_artifact("a1")).await.unwrap();
    let status = wait_for(&engine, "backoff", |s| {
        s.coordinator_state != CoordinatorState::Idle && !s.is_syncing
    })
    .await;
    assert!(matches!(status.coordinator_state, CoordinatorState::Backoff { attempt: 1, .. }));

    wait_for(&engine, "retry", |s| s.is_settled()).await;
    assert_eq!(engine.sync_stats().unwrap().cycles_failed, 1);
}

#[tokio::test]
async fn data_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::at(dir.path().join("store"));

    let first = Engine::new(config.clone(), MockRemote::new());
    first.initialize().await.unwrap();
    first.save_conversation(Conversation::new("Persisted").with_id("c1")).await.unwrap();
    first.save_message(sample_message("c1", 0)).await.unwrap();
    first.shutdown().await.unwrap();
    assert!(!first.is_initialized());

    let second = Engine::new(config, MockRemote::new());
    second.initialize().await.unwrap();
    let conversation = second.get_conversation("c1").await.unwrap().unwrap();
    assert_eq!(conversation.title, "Persisted");
    assert_eq!(conversation.message_ids, vec!["c1-m0".to_string()]);
    let status = second.get_sync_status().await.unwrap();
    assert_eq!(status.pending_total(), 2);
}

#[tokio::test]
async fn corruption_requires_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store");
    let config = EngineConfig::at(&path);

    let first = Engine::new(config.clone(), MockRemote::new());
    first.initialize().await.unwrap();
    first.save_conversation(sample_conversation("c1")).await.unwrap();
    first.shutdown().await.unwrap();

    let log = path.join("store.log");
    let mut bytes = std::fs::read(&log).unwrap();
    bytes[13] ^= 0xFF;
    std::fs::write(&log, bytes).unwrap();

    let second = Engine::new(config, MockRemote::new());
    assert!(matches!(second.initialize().await, Err(EngineError::Corrupted { .. })));
    assert!(matches!(second.get_conversations().await, Err(EngineError::Corrupted { .. })));
    assert!(matches!(second.initialize().await, Err(EngineError::Corrupted { .. })));

    second.reset().await.unwrap();
    assert!(second.is_initialized());
    assert!(second.get_conversations().await.unwrap().is_empty());
    second.save_conversation(sample_conversation("c2")).await.unwrap();
    assert_eq!(second.get_sync_status().await.unwrap().pending_conversations, 1);
}
