//! Node-local runtime context: journal, configuration, resident actors, and
//! remote-dispatch targets.
//!
//! An [`AggregateStore`] is built once per node via [`AggregateStoreBuilder`]
//! and threaded explicitly into the [`ShardCoordinator`](crate::ShardCoordinator),
//! [`OutboxPublisher`](crate::OutboxPublisher), and
//! [`Projector`](crate::Projector). It knows nothing about shards; it only
//! keeps at most one resident actor per stream.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::RwLock;

use crate::actor::{ActorConfig, AggregateHandle, spawn_actor};
use crate::aggregate::Aggregate;
use crate::command::{CommandContext, CommandEnvelope};
use crate::config::RuntimeConfig;
use crate::error::{ExecuteError, JournalError, RemoteFailure, StateError};
use crate::event::{EntityKey, StreamId};
use crate::journal::{EventJournal, MemoryJournal, OutboxStore};

/// Type-erased view of a cached [`AggregateHandle`].
#[async_trait]
trait ResidentActor: Send + Sync {
    fn is_alive(&self) -> bool;
    async fn passivate(&self);
    async fn stopped(&self);
    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
impl<A: Aggregate> ResidentActor for AggregateHandle<A> {
    fn is_alive(&self) -> bool {
        AggregateHandle::is_alive(self)
    }

    async fn passivate(&self) {
        AggregateHandle::passivate(self).await;
    }

    async fn stopped(&self) {
        AggregateHandle::stopped(self).await;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type HandleCache = HashMap<(TypeId, StreamId), Box<dyn ResidentActor>>;

type DispatcherMap = HashMap<String, Box<dyn AggregateDispatcher>>;

/// Node-local runtime context.
///
/// Cheap to clone; clones share the same journal, cache, and dispatchers.
#[derive(Clone)]
pub struct AggregateStore {
    journal: Arc<dyn EventJournal>,
    outbox: Arc<dyn OutboxStore>,
    config: Arc<RuntimeConfig>,
    cache: Arc<RwLock<HandleCache>>,
    dispatchers: Arc<DispatcherMap>,
}

// `dyn Any` is not `Debug`, and the cache is an internal detail.
impl std::fmt::Debug for AggregateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateStore")
            .field("config", &self.config)
            .field("dispatchers", &self.dispatchers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AggregateStore {
    /// Start building a store.
    pub fn builder() -> AggregateStoreBuilder {
        AggregateStoreBuilder::new()
    }

    /// Get a handle to the resident instance of `A` at `key`, hydrating and
    /// spawning it if it is not resident.
    ///
    /// # Arguments
    ///
    /// * `key` - Entity key within `A`'s aggregate type.
    ///
    /// # Returns
    ///
    /// A live [`AggregateHandle`]. If a passivating actor for the same
    /// stream is still draining its mailbox, the call waits for it to exit
    /// before spawning the replacement.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if hydration fails.
    pub async fn get<A: Aggregate>(&self, key: &EntityKey) -> Result<AggregateHandle<A>, JournalError> {
        let stream = StreamId::of::<A>(key);
        let cache_key = (TypeId::of::<A>(), stream.clone());

        // Fast path: check cache with read lock.
        {
            let cache = self.cache.read().await;
            if let Some(handle) = live_handle::<A>(&cache, &cache_key) {
                return Ok(handle);
            }
        }

        // Slow path: spawn under the write lock so concurrent callers never
        // start two actors for one stream.
        let mut cache = self.cache.write().await;
        if let Some(handle) = live_handle::<A>(&cache, &cache_key) {
            return Ok(handle);
        }
        // An idle actor closes its mailbox before answering what is still
        // queued. Keep the lock until it has exited so at most one writer
        // per stream is resident.
        if let Some(stale) = cache.remove(&cache_key) {
            stale.stopped().await;
        }

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            entity_key = %key,
            "spawning actor"
        );
        let handle = spawn_actor::<A>(
            Arc::clone(&self.journal),
            stream,
            ActorConfig::from(&*self.config),
        )?;
        cache.insert(cache_key, Box::new(handle.clone()));
        Ok(handle)
    }

    /// Execute a command against the resident instance of `A` at `key`.
    ///
    /// If the instance passivated between lookup and delivery, it is
    /// hydrated again and the command delivered once more.
    ///
    /// # Errors
    ///
    /// See [`AggregateHandle::execute`].
    pub async fn execute<A: Aggregate>(
        &self,
        key: &EntityKey,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<A::Reply, ExecuteError<A::Error>> {
        let handle = self.get::<A>(key).await?;
        match handle.execute(cmd.clone(), ctx.clone()).await {
            Err(ExecuteError::ActorGone) => {
                tracing::debug!(entity_key = %key, "actor passivated under us; respawning");
                self.get::<A>(key).await?.execute(cmd, ctx).await
            }
            other => other,
        }
    }

    /// Current state of the instance of `A` at `key`.
    ///
    /// # Errors
    ///
    /// See [`AggregateHandle::state`].
    pub async fn state<A: Aggregate>(&self, key: &EntityKey) -> Result<A, StateError> {
        let handle = self.get::<A>(key).await?;
        match handle.state().await {
            Err(StateError::ActorGone) => self.get::<A>(key).await?.state().await,
            other => other,
        }
    }

    /// Passivate every resident instance whose stream matches `pred` and wait
    /// until each has drained its mailbox and exited.
    ///
    /// # Arguments
    ///
    /// * `pred` - Selects the streams to passivate; called once per cached
    ///   stream while the cache is locked.
    ///
    /// # Returns
    ///
    /// How many matching instances were still live.
    pub async fn passivate_where(&self, mut pred: impl FnMut(&StreamId) -> bool) -> usize {
        // Hold the write lock throughout so no matching stream is respawned
        // before its old actor has exited.
        let mut cache = self.cache.write().await;
        let keys: Vec<_> = cache.keys().filter(|(_, s)| pred(s)).cloned().collect();
        let mut passivated = 0;
        for key in keys {
            if let Some(actor) = cache.remove(&key) {
                if actor.is_alive() {
                    passivated += 1;
                }
                actor.passivate().await;
            }
        }
        passivated
    }

    /// Passivate every resident instance.
    pub async fn shutdown(&self) -> usize {
        self.passivate_where(|_| true).await
    }

    /// Number of resident, live instances.
    pub async fn resident_count(&self) -> usize {
        self.cache
            .read()
            .await
            .values()
            .filter(|actor| actor.is_alive())
            .count()
    }

    /// Execute a type-erased command forwarded from another node.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteFailure::Malformed`] if no dispatcher is registered for
    /// the envelope's aggregate type, and the flattened execution error
    /// otherwise.
    pub async fn dispatch(&self, envelope: CommandEnvelope) -> Result<serde_json::Value, RemoteFailure> {
        let Some(dispatcher) = self.dispatchers.get(&envelope.aggregate_type) else {
            return Err(RemoteFailure::Malformed(format!(
                "unknown aggregate type: {}",
                envelope.aggregate_type
            )));
        };
        dispatcher.dispatch(self, envelope).await
    }

    /// The journal.
    pub fn journal(&self) -> Arc<dyn EventJournal> {
        Arc::clone(&self.journal)
    }

    /// The outbox half of the journal.
    pub fn outbox(&self) -> Arc<dyn OutboxStore> {
        Arc::clone(&self.outbox)
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

fn live_handle<A: Aggregate>(
    cache: &HandleCache,
    key: &(TypeId, StreamId),
) -> Option<AggregateHandle<A>> {
    let actor = cache.get(key)?;
    let handle = actor.as_any().downcast_ref::<AggregateHandle<A>>()?;
    handle.is_alive().then(|| handle.clone())
}

// --- Type-erased dispatch for forwarded commands ---

#[async_trait]
trait AggregateDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        store: &AggregateStore,
        envelope: CommandEnvelope,
    ) -> Result<serde_json::Value, RemoteFailure>;
}

struct TypedDispatcher<A: Aggregate> {
    _marker: std::marker::PhantomData<fn() -> A>,
}

#[async_trait]
impl<A> AggregateDispatcher for TypedDispatcher<A>
where
    A: Aggregate,
    A::Command: DeserializeOwned,
    A::Reply: Serialize,
    A::Error: Serialize,
{
    async fn dispatch(
        &self,
        store: &AggregateStore,
        envelope: CommandEnvelope,
    ) -> Result<serde_json::Value, RemoteFailure> {
        let cmd: A::Command = serde_json::from_value(envelope.command)
            .map_err(|e| RemoteFailure::Malformed(format!("command deserialization failed: {e}")))?;
        let reply = store
            .execute::<A>(&envelope.entity_key, cmd, envelope.context)
            .await
            .map_err(|e| e.to_remote())?;
        serde_json::to_value(reply)
            .map_err(|e| RemoteFailure::Malformed(format!("reply serialization failed: {e}")))
    }
}

/// Builder for [`AggregateStore`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use artifact_es::{AggregateStore, MemoryJournal};
///
/// let store = AggregateStore::builder()
///     .journal(Arc::new(MemoryJournal::new()))
///     .idle_timeout(Duration::from_secs(60))
///     .build();
/// assert_eq!(store.config().idle_timeout, Duration::from_secs(60));
/// ```
pub struct AggregateStoreBuilder {
    journal: Option<(Arc<dyn EventJournal>, Arc<dyn OutboxStore>)>,
    config: RuntimeConfig,
    dispatchers: DispatcherMap,
}

impl AggregateStoreBuilder {
    /// Create a builder with default configuration and no journal.
    pub fn new() -> Self {
        Self {
            journal: None,
            config: RuntimeConfig::default(),
            dispatchers: HashMap::new(),
        }
    }

    /// Use `journal` for events, snapshots, and the outbox. Defaults to a
    /// fresh [`MemoryJournal`].
    ///
    /// # Arguments
    ///
    /// * `journal` - Any backend implementing both [`EventJournal`] and
    ///   [`OutboxStore`], so that events and outbox records commit
    ///   together.
    pub fn journal<J: EventJournal + OutboxStore>(mut self, journal: Arc<J>) -> Self {
        let outbox: Arc<dyn OutboxStore> = Arc::clone(&journal) as Arc<dyn OutboxStore>;
        self.journal = Some((journal, outbox));
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the idle passivation timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the snapshot interval in events.
    pub fn snapshot_every(mut self, events: u64) -> Self {
        self.config.snapshot_every = events;
        self
    }

    /// Accept forwarded commands for aggregate type `A`.
    pub fn aggregate_type<A>(mut self) -> Self
    where
        A: Aggregate,
        A::Command: DeserializeOwned,
        A::Reply: Serialize,
        A::Error: Serialize,
    {
        self.dispatchers.insert(
            A::AGGREGATE_TYPE.to_owned(),
            Box::new(TypedDispatcher::<A> {
                _marker: std::marker::PhantomData,
            }),
        );
        self
    }

    /// Build the store.
    pub fn build(self) -> AggregateStore {
        let (journal, outbox) = self.journal.unwrap_or_else(|| {
            let journal = Arc::new(MemoryJournal::new());
            (
                Arc::clone(&journal) as Arc<dyn EventJournal>,
                journal as Arc<dyn OutboxStore>,
            )
        });
        AggregateStore {
            journal,
            outbox,
            config: Arc::new(self.config),
            cache: Arc::new(RwLock::new(HashMap::new())),
            dispatchers: Arc::new(self.dispatchers),
        }
    }
}

impl Default for AggregateStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
