//! The engine facade.

use crate::config::{EngineConfig, StoreLocation};
use crate::error::{EngineError, EngineResult};
use crate::status::{ConflictInfo, SyncStatus};
use chrono::DateTime;
use convsync_core::{
    Artifact, Conversation, CoreError, CoreResult, Entity, EntityKind, LocalStore,
    MarkSyncedOutcome, Message, MetaKey, RecordKey,
};
use convsync_storage::InMemoryBackend;
use convsync_sync_engine::{
    ConnectivityMonitor, ConnectivitySignal, CoordinatorHandle, CoordinatorState,
    RemoteCollaborator, SyncCoordinator, SyncStats,
};
use parking_lot::RwLock;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;

/// Initialization state of an [`Engine`].
enum Lifecycle {
    Uninitialized,
    Ready(Running),
    Corrupted(String),
}

#[derive(Clone)]
struct Running {
    store: Arc<LocalStore>,
    coordinator: Arc<CoordinatorHandle>,
}

/// The offline-first engine: a local store, a connectivity monitor and a
/// sync coordinator behind one async API.
///
/// The engine is constructed explicitly and must be [initialized]
/// before use; every other operation fails with
/// [`EngineError::NotInitialized`] until then. Store work runs on tokio's
/// blocking pool, so callers suspend but never block the runtime.
///
/// Saves always store the record as pending, whatever its `synced` flag
/// says, and wake the coordinator.
///
/// # Example
///
/// ```rust,ignore
/// use convsync::{Engine, EngineConfig, Conversation, Message, Role};
///
/// let engine = Engine::new(EngineConfig::at("chat-store"), MyRemote::new());
/// engine.initialize().await?;
/// engine.connectivity_signal()?.report(true);
///
/// let conversation = Conversation::new("Trip planning");
/// let id = conversation.id.clone();
/// engine.save_conversation(conversation).await?;
/// engine.save_message(Message::new(&id, Role::User, "Ideas for Lisbon?")).await?;
///
/// let status = engine.get_sync_status().await?;
/// println!("{} pending", status.pending_total());
/// ```
///
/// [initialized]: Engine::initialize
pub struct Engine<R: RemoteCollaborator> {
    config: EngineConfig,
    remote: Arc<R>,
    lifecycle: RwLock<Lifecycle>,
    // Serializes initialize, reset and shutdown.
    transitions: tokio::sync::Mutex<()>,
    monitor: OnceLock<ConnectivityMonitor>,
}

impl<R: RemoteCollaborator> Engine<R> {
    /// Creates an engine. Nothing is opened until [`Engine::initialize`].
    pub fn new(config: EngineConfig, remote: R) -> Self {
        Self::with_shared_remote(config, Arc::new(remote))
    }

    /// Creates an engine over a remote the caller keeps a handle to.
    pub fn with_shared_remote(config: EngineConfig, remote: Arc<R>) -> Self {
        Self {
            config,
            remote,
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
            transitions: tokio::sync::Mutex::new(()),
            monitor: OnceLock::new(),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns true once [`Engine::initialize`] succeeded.
    pub fn is_initialized(&self) -> bool {
        matches!(*self.lifecycle.read(), Lifecycle::Ready(_))
    }

    // ---- lifecycle ------------------------------------------------------

    /// Opens or creates the store and starts the coordinator. Calling it
    /// again is a no-op.
    ///
    /// # Errors
    ///
    /// [`EngineError::Corrupted`] if the store is damaged; the engine then
    /// refuses every operation until [`Engine::reset`].
    pub async fn initialize(&self) -> EngineResult<()> {
        let _transition = self.transitions.lock().await;
        match &*self.lifecycle.read() {
            Lifecycle::Ready(_) => return Ok(()),
            Lifecycle::Corrupted(message) => {
                return Err(EngineError::Corrupted {
                    message: message.clone(),
                })
            }
            Lifecycle::Uninitialized => {}
        }

        let config = self.config.clone();
        match blocking_open(move || open_store(&config)).await {
            Ok(store) => {
                self.start(store);
                Ok(())
            }
            Err(EngineError::Corrupted { message }) => {
                tracing::error!(%message, "store corrupted; reset required");
                *self.lifecycle.write() = Lifecycle::Corrupted(message.clone());
                Err(EngineError::Corrupted { message })
            }
            Err(err) => Err(err),
        }
    }

    /// Stops the coordinator and closes the store. The engine can be
    /// initialized again afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator task failed.
    pub async fn shutdown(&self) -> EngineResult<()> {
        let _transition = self.transitions.lock().await;
        let previous = std::mem::replace(&mut *self.lifecycle.write(), Lifecycle::Uninitialized);
        if let Lifecycle::Ready(running) = previous {
            running.coordinator.shutdown().await?;
            tracing::info!("engine shut down");
        }
        Ok(())
    }

    /// Discards every local record, pending ones included, and starts over
    /// with an empty store. This is the way out of
    /// [`EngineError::Corrupted`].
    ///
    /// Receivers from [`Engine::subscribe_state`] taken before the reset
    /// stop receiving updates.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be removed or recreated.
    pub async fn reset(&self) -> EngineResult<()> {
        let _transition = self.transitions.lock().await;
        let previous = std::mem::replace(&mut *self.lifecycle.write(), Lifecycle::Uninitialized);
        if let Lifecycle::Ready(running) = previous {
            running.coordinator.shutdown().await?;
        }

        let config = self.config.clone();
        let store = blocking_open(move || {
            if let StoreLocation::Directory(path) = &config.location {
                LocalStore::destroy(path)?;
            }
            open_store(&config)
        })
        .await?;
        tracing::warn!("store reset; local data discarded");
        self.start(store);
        Ok(())
    }

    fn start(&self, store: LocalStore) {
        let monitor = self
            .monitor
            .get_or_init(|| ConnectivityMonitor::spawn(self.config.sync.debounce));
        let store = Arc::new(store);
        let coordinator = SyncCoordinator::spawn(
            Arc::clone(&store),
            Arc::clone(&self.remote),
            monitor.subscribe(),
            self.config.sync.clone(),
        );
        tracing::info!(
            location = ?self.config.location,
            pending = store.pending_counts().total(),
            "engine initialized"
        );
        *self.lifecycle.write() = Lifecycle::Ready(Running {
            store,
            coordinator: Arc::new(coordinator),
        });
    }

    fn running(&self) -> EngineResult<Running> {
        match &*self.lifecycle.read() {
            Lifecycle::Ready(running) => Ok(running.clone()),
            Lifecycle::Uninitialized => Err(EngineError::NotInitialized),
            Lifecycle::Corrupted(message) => Err(EngineError::Corrupted {
                message: message.clone(),
            }),
        }
    }

    async fn with_store<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&LocalStore) -> CoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let running = self.running()?;
        blocking(running.store, f).await
    }

    // ---- writes ---------------------------------------------------------

    /// Stores a message as pending and appends it to its conversation.
    ///
    /// # Errors
    ///
    /// [`EngineError::Storage`] if the conversation does not exist or the
    /// message belongs to another conversation.
    pub async fn save_message(&self, message: Message) -> EngineResult<()> {
        self.save(Entity::Message(message)).await
    }

    /// Stores a conversation as pending. Its message list is kept by the
    /// store; the one passed in is ignored for existing conversations.
    ///
    /// # Errors
    ///
    /// [`EngineError::Storage`] if a new conversation already lists
    /// messages.
    pub async fn save_conversation(&self, conversation: Conversation) -> EngineResult<()> {
        self.save(Entity::Conversation(conversation)).await
    }

    /// Stores an artifact as pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn save_artifact(&self, artifact: Artifact) -> EngineResult<()> {
        self.save(Entity::Artifact(artifact)).await
    }

    async fn save(&self, mut entity: Entity) -> EngineResult<()> {
        entity.set_synced(false);
        let running = self.running()?;
        let key = entity.key();
        blocking(Arc::clone(&running.store), move |store| store.put(entity)).await?;
        tracing::debug!(%key, "saved");
        running.coordinator.trigger();
        Ok(())
    }

    /// Deletes a conversation and its messages. Returns false if it did
    /// not exist. Deletes stay local.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; nothing is removed then.
    pub async fn delete_conversation(&self, id: &str) -> EngineResult<bool> {
        self.delete(EntityKind::Conversation, id).await
    }

    /// Deletes a message. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn delete_message(&self, id: &str) -> EngineResult<bool> {
        self.delete(EntityKind::Message, id).await
    }

    /// Deletes an artifact. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn delete_artifact(&self, id: &str) -> EngineResult<bool> {
        self.delete(EntityKind::Artifact, id).await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> EngineResult<bool> {
        let id = id.to_owned();
        let deleted = self
            .with_store(move |store| store.delete(kind, &id))
            .await?;
        Ok(deleted)
    }

    // ---- reads ----------------------------------------------------------

    /// The messages of a conversation in conversational order. Empty for
    /// an unknown conversation.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotInitialized`] before initialization.
    pub async fn get_messages_by_conversation_id(&self, id: &str) -> EngineResult<Vec<Message>> {
        let id = id.to_owned();
        self.with_store(move |store| Ok(store.list_by_conversation(&id).collect()))
            .await
    }

    /// All conversations, most recently updated first.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotInitialized`] before initialization.
    pub async fn get_conversations(&self) -> EngineResult<Vec<Conversation>> {
        self.with_store(|store| {
            let mut conversations = store.conversations();
            conversations.sort_by(|a, b| {
                b.updated_at
                    .cmp(&a.updated_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            Ok(conversations)
        })
        .await
    }

    /// A conversation by id.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotInitialized`] before initialization.
    pub async fn get_conversation(&self, id: &str) -> EngineResult<Option<Conversation>> {
        let id = id.to_owned();
        self.with_store(move |store| Ok(store.get_conversation(&id)))
            .await
    }

    /// A message by id.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotInitialized`] before initialization.
    pub async fn get_message(&self, id: &str) -> EngineResult<Option<Message>> {
        let id = id.to_owned();
        self.with_store(move |store| Ok(store.get_message(&id))).await
    }

    /// An artifact by id.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotInitialized`] before initialization.
    pub async fn get_artifact(&self, id: &str) -> EngineResult<Option<Artifact>> {
        let id = id.to_owned();
        self.with_store(move |store| Ok(store.get_artifact(&id))).await
    }

    /// All artifacts, in id order.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotInitialized`] before initialization.
    pub async fn get_artifacts(&self) -> EngineResult<Vec<Artifact>> {
        self.with_store(|store| Ok(store.artifacts())).await
    }

    // ---- sync -----------------------------------------------------------

    /// The current sync status.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotInitialized`] before initialization.
    pub async fn get_sync_status(&self) -> EngineResult<SyncStatus> {
        let running = self.running()?;
        let coordinator_state = running.coordinator.state();
        let is_online = self.monitor.get().is_some_and(|m| m.current().is_online());

        blocking(running.store, move |store| {
            let pending = store.pending_counts();
            let conflicts = store
                .markers()
                .into_iter()
                .filter_map(|(key, marker)| ConflictInfo::from_marker(key, marker))
                .collect();
            Ok(SyncStatus {
                last_full_sync: store
                    .meta(MetaKey::LastFullSync)
                    .and_then(DateTime::from_timestamp_millis),
                pending_messages: pending.messages,
                pending_conversations: pending.conversations,
                pending_artifacts: pending.artifacts,
                is_online,
                is_syncing: coordinator_state.is_draining(),
                coordinator_state,
                conflicts,
            })
        })
        .await
    }

    /// Marks a record as acknowledged by the remote, outside the
    /// coordinator. Marking a synced record again changes nothing.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownRecord`] if the record was never stored.
    pub async fn mark_as_synced(&self, kind: EntityKind, id: &str) -> EngineResult<MarkSyncedOutcome> {
        let key = RecordKey::new(kind, id);
        self.with_store(move |store| store.mark_synced(&key, None))
            .await
    }

    /// Resolves a conflict or rejection by keeping the local copy: the
    /// next cycle resubmits it as an overwrite. Returns false if the record
    /// was not flagged.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownRecord`] if the record was never stored.
    pub async fn resolve_conflict(&self, kind: EntityKind, id: &str) -> EngineResult<bool> {
        let running = self.running()?;
        let key = RecordKey::new(kind, id);
        let resolved = blocking(Arc::clone(&running.store), move |store| {
            store.transaction(|txn| {
                if txn.ledger().entry(&key).is_none() {
                    return Err(CoreError::UnknownRecord(key.clone()));
                }
                if !txn.ledger().marker(&key).is_some_and(|m| m.kind.holds_back()) {
                    return Ok(false);
                }
                txn.resolve_keep_local(&key)?;
                tracing::info!(%key, "conflict resolved in favour of local copy");
                Ok(true)
            })
        })
        .await?;
        if resolved {
            running.coordinator.trigger();
        }
        Ok(resolved)
    }

    /// Asks for a drain cycle now. Ignored while offline.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotInitialized`] before initialization, or
    /// [`EngineError::Sync`] if the coordinator stopped on its own.
    pub fn trigger_sync(&self) -> EngineResult<()> {
        self.running()?.coordinator.try_trigger()?;
        Ok(())
    }

    /// The handle the platform reports reachability through.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotInitialized`] before initialization.
    pub fn connectivity_signal(&self) -> EngineResult<ConnectivitySignal> {
        self.running()?;
        self.monitor
            .get()
            .map(ConnectivityMonitor::signal)
            .ok_or(EngineError::NotInitialized)
    }

    /// A receiver of coordinator state changes.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotInitialized`] before initialization.
    pub fn subscribe_state(&self) -> EngineResult<watch::Receiver<CoordinatorState>> {
        Ok(self.running()?.coordinator.subscribe())
    }

    /// Running totals of the coordinator.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotInitialized`] before initialization.
    pub fn sync_stats(&self) -> EngineResult<SyncStats> {
        Ok(self.running()?.coordinator.stats())
    }
}

fn open_store(config: &EngineConfig) -> CoreResult<LocalStore> {
    match &config.location {
        StoreLocation::InMemory => {
            LocalStore::open_with_backend(Box::new(InMemoryBackend::new()), config.store.clone())
        }
        StoreLocation::Directory(path) => LocalStore::open(path, config.store.clone()),
    }
}

async fn blocking_open<F>(f: F) -> EngineResult<LocalStore>
where
    F: FnOnce() -> CoreResult<LocalStore> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => Ok(result?),
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => Err(EngineError::Task(err.to_string())),
    }
}

async fn blocking<T, F>(store: Arc<LocalStore>, f: F) -> EngineResult<T>
where
    F: FnOnce(&LocalStore) -> CoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(move || f(&store)).await {
        Ok(result) => Ok(result?),
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => Err(EngineError::Task(err.to_string())),
    }
}
