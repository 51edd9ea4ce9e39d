//! Tag-partitioned read models.
//!
//! Every event carries a projection tag derived from its entity key (see
//! [`shard_tag`]). A [`Projector`] keeps one partition of its read model per
//! tag, each with its own [`ProjectionCursor`], so tags catch up in parallel
//! and a failure only replays that tag's unprocessed suffix.
//!
//! Partitions are checkpointed as `{ "state": <P>, "cursor": {..} }` to
//! `<dir>/<P::NAME>/tag-<n>.json` via temp file + rename. A corrupt
//! checkpoint is discarded and that tag rebuilds from position 0.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::ProjectionConfig;
use crate::error::ProjectionError;
use crate::event::{EntityKey, StoredEvent, shard_tag};
use crate::journal::EventJournal;
use crate::outbox::OutboxRecord;
use crate::store::AggregateStore;

/// A read model built from the journal.
///
/// # Contract
///
/// - [`apply`](Projection::apply) must be deterministic.
/// - An event may be applied more than once across crashes and broker
///   redelivery. Field-set updates are naturally idempotent; append-style
///   updates must remember the event ids they have absorbed.
/// - Unknown aggregate or event types should be ignored.
pub trait Projection:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Name of the read model, used as the checkpoint directory name.
    const NAME: &'static str;

    /// Fold one event into this partition.
    fn apply(&mut self, event: &StoredEvent);
}

/// Progress of one tag partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionCursor {
    /// The tag.
    pub tag: u32,
    /// Next global position to apply; every event of this tag below it has
    /// been applied.
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TagCheckpoint<P> {
    state: P,
    cursor: ProjectionCursor,
}

/// One tag partition and where it is checkpointed.
struct TagRunner<P: Projection> {
    checkpoint: TagCheckpoint<P>,
    path: Option<PathBuf>,
}

impl<P: Projection> TagRunner<P> {
    fn open(tag: u32, dir: Option<&Path>) -> Self {
        let path = dir.map(|d| d.join(format!("tag-{tag}.json")));
        let checkpoint = path
            .as_deref()
            .and_then(|p| load_checkpoint::<P>(p, tag))
            .unwrap_or_else(|| TagCheckpoint {
                state: P::default(),
                cursor: ProjectionCursor { tag, offset: 0 },
            });
        Self { checkpoint, path }
    }

    /// Apply `event` unless it belongs to another tag or was already applied.
    fn apply_event(&mut self, event: &StoredEvent) -> bool {
        let cursor = &mut self.checkpoint.cursor;
        if event.tag != cursor.tag || event.global_position < cursor.offset {
            return false;
        }
        self.checkpoint.state.apply(event);
        cursor.offset = event.global_position + 1;
        tracing::trace!(
            projection = P::NAME,
            tag = cursor.tag,
            global_position = event.global_position,
            event_type = %event.event_type,
            "event applied"
        );
        true
    }

    fn save(&self) -> Result<(), ProjectionError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.checkpoint)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Apply every journal event of this tag from the cursor on.
    fn catch_up(&mut self, journal: &dyn EventJournal, batch_size: usize) -> Result<usize, ProjectionError> {
        let batch_size = batch_size.max(1);
        let mut applied = 0;
        loop {
            let batch = journal.read_tag(self.checkpoint.cursor.tag, self.checkpoint.cursor.offset, batch_size)?;
            let exhausted = batch.len() < batch_size;
            for event in &batch {
                if self.apply_event(event) {
                    applied += 1;
                }
            }
            if exhausted || batch.is_empty() {
                break;
            }
        }
        if applied > 0 {
            self.save()?;
        }
        Ok(applied)
    }
}

fn load_checkpoint<P: Projection>(path: &Path, tag: u32) -> Option<TagCheckpoint<P>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable projection checkpoint, will rebuild");
            return None;
        }
    };
    match serde_json::from_slice::<TagCheckpoint<P>>(&bytes) {
        Ok(checkpoint) if checkpoint.cursor.tag == tag => Some(checkpoint),
        Ok(_) => {
            tracing::warn!(path = %path.display(), tag, "checkpoint belongs to another tag, will rebuild");
            None
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt projection checkpoint, will rebuild");
            None
        }
    }
}

/// Maintains a [`Projection`] per tag over a journal.
///
/// Cheap to clone; clones share partitions.
pub struct Projector<P: Projection> {
    journal: Arc<dyn EventJournal>,
    config: ProjectionConfig,
    runners: Arc<Vec<Mutex<TagRunner<P>>>>,
}

impl<P: Projection> Clone for Projector<P> {
    fn clone(&self) -> Self {
        Self {
            journal: Arc::clone(&self.journal),
            config: self.config.clone(),
            runners: Arc::clone(&self.runners),
        }
    }
}

impl<P: Projection> Projector<P> {
    /// Create a projector over `store`'s journal with one partition per
    /// configured tag. With a `checkpoint_dir`, partitions resume from their
    /// checkpoints under `<checkpoint_dir>/<P::NAME>/`; without one they
    /// start empty.
    pub fn new(store: &AggregateStore, checkpoint_dir: Option<&Path>) -> Self {
        let dir = checkpoint_dir.map(|d| d.join(P::NAME));
        let runners = (0..store.config().tag_count.max(1))
            .map(|tag| Mutex::new(TagRunner::open(tag, dir.as_deref())))
            .collect();
        Self {
            journal: store.journal(),
            config: store.config().projection.clone(),
            runners: Arc::new(runners),
        }
    }

    /// Number of tag partitions.
    pub fn tag_count(&self) -> u32 {
        self.runners.len() as u32
    }

    /// Catch one tag up with the journal. Returns how many events were
    /// applied. Unknown tags apply nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the journal cannot be read or the
    /// checkpoint cannot be saved. Events applied before the failure stay
    /// applied in memory.
    pub async fn catch_up_tag(&self, tag: u32) -> Result<usize, ProjectionError> {
        let Some(runner) = self.runners.get(tag as usize) else {
            return Ok(0);
        };
        let mut runner = runner.lock().await;
        let applied = runner.catch_up(self.journal.as_ref(), self.config.batch_size)?;
        if applied > 0 {
            tracing::debug!(projection = P::NAME, tag, applied, "tag caught up");
        }
        Ok(applied)
    }

    /// Catch every tag up with the journal, one task per tag. Returns the
    /// total number of events applied.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProjectionError`] any tag hit. Other tags still
    /// finish.
    pub async fn catch_up(&self) -> Result<usize, ProjectionError> {
        let mut tasks = JoinSet::new();
        for tag in 0..self.tag_count() {
            let projector = self.clone();
            tasks.spawn(async move { projector.catch_up_tag(tag).await });
        }
        let mut applied = 0;
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(ProjectionError::from).and_then(|r| r) {
                Ok(n) => applied += n,
                Err(e) => {
                    tracing::error!(projection = P::NAME, error = %e, "tag catch-up failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(applied),
        }
    }

    /// Apply an event delivered by the broker. Returns `true` if it was new.
    ///
    /// The publisher delivers records in commit order, so any event below
    /// the tag's cursor is a redelivery and is skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the checkpoint cannot be saved.
    pub async fn deliver(&self, event: &StoredEvent) -> Result<bool, ProjectionError> {
        let Some(runner) = self.runners.get(event.tag as usize) else {
            tracing::warn!(projection = P::NAME, tag = event.tag, "event for unknown tag ignored");
            return Ok(false);
        };
        let mut runner = runner.lock().await;
        if !runner.apply_event(event) {
            tracing::debug!(
                projection = P::NAME,
                tag = event.tag,
                global_position = event.global_position,
                "duplicate delivery skipped"
            );
            return Ok(false);
        }
        runner.save()?;
        Ok(true)
    }

    /// Decode an outbox record and [`deliver`](Self::deliver) its event.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Serialization`] for a payload that is not
    /// a stored event, or whatever `deliver` returns.
    pub async fn deliver_record(&self, record: &OutboxRecord) -> Result<bool, ProjectionError> {
        let event = record.decode_event()?;
        self.deliver(&event).await
    }

    /// Cursor of `tag`.
    pub async fn cursor(&self, tag: u32) -> Option<ProjectionCursor> {
        let runner = self.runners.get(tag as usize)?;
        Some(runner.lock().await.checkpoint.cursor)
    }

    /// Copy of `tag`'s partition.
    pub async fn partition(&self, tag: u32) -> Option<P> {
        let runner = self.runners.get(tag as usize)?;
        Some(runner.lock().await.checkpoint.state.clone())
    }

    /// Copy of the partition holding `key`'s rows.
    pub async fn partition_for(&self, key: &EntityKey) -> P {
        let tag = shard_tag(key, self.tag_count());
        self.partition(tag).await.unwrap_or_default()
    }

    /// Copies of every partition, in tag order.
    pub async fn partitions(&self) -> Vec<P> {
        let mut partitions = Vec::with_capacity(self.runners.len());
        for runner in self.runners.iter() {
            partitions.push(runner.lock().await.checkpoint.state.clone());
        }
        partitions
    }

    /// Catch up every `poll_interval` until shut down.
    pub fn spawn(self) -> ProjectorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
                // Failures are logged per tag; the next tick retries.
                let _ = self.catch_up().await;
            }
        });
        ProjectorHandle::new(shutdown_tx, task)
    }

    /// Apply records as the broker delivers them until shut down. Catches
    /// up from the journal first, and again whenever the feed lagged.
    pub fn follow(self, mut feed: broadcast::Receiver<OutboxRecord>) -> ProjectorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let _ = self.catch_up().await;
            loop {
                tokio::select! {
                    received = feed.recv() => match received {
                        Ok(record) => {
                            if let Err(e) = self.deliver_record(&record).await {
                                tracing::error!(
                                    projection = P::NAME,
                                    record_id = record.id,
                                    error = %e,
                                    "broker delivery failed"
                                );
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(projection = P::NAME, missed, "feed lagged; catching up from journal");
                            let _ = self.catch_up().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
        ProjectorHandle::new(shutdown_tx, task)
    }
}

/// Control handle for a background projector loop.
pub struct ProjectorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProjectorHandle {
    fn new(shutdown_tx: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self {
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop the loop and wait for it to exit. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the `JoinError` if the loop panicked.
    pub async fn shutdown(&self) -> Result<(), tokio::task::JoinError> {
        let _ = self.shutdown_tx.send(true);
        match self.task.lock().await.take() {
            Some(task) => task.await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterCommand};
    use crate::command::CommandContext;
    use crate::config::RuntimeConfig;
    use crate::journal::MemoryJournal;
    use std::collections::BTreeMap;
    use std::time::Duration;

    /// Per-key event counts, deduplicated by event id.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Tally {
        counts: BTreeMap<String, u64>,
        seen: std::collections::BTreeSet<uuid::Uuid>,
    }

    impl Projection for Tally {
        const NAME: &'static str = "tally";

        fn apply(&mut self, event: &StoredEvent) {
            if self.seen.insert(event.event_id) {
                *self.counts.entry(event.entity_key.to_string()).or_default() += 1;
            }
        }
    }

    fn store(journal: &Arc<MemoryJournal>) -> AggregateStore {
        AggregateStore::builder()
            .journal(Arc::clone(journal))
            .config(RuntimeConfig {
                tag_count: 4,
                ..RuntimeConfig::default()
            })
            .build()
    }

    async fn bump(store: &AggregateStore, key: &str, times: usize) {
        for _ in 0..times {
            store
                .execute::<Counter>(&EntityKey::new(key), CounterCommand::Increment, CommandContext::default())
                .await
                .expect("increment should succeed");
        }
    }

    async fn total(projector: &Projector<Tally>) -> u64 {
        projector
            .partitions()
            .await
            .iter()
            .flat_map(|p| p.counts.values())
            .sum()
    }

    #[tokio::test]
    async fn catch_up_fans_out_over_tags() {
        let journal = Arc::new(MemoryJournal::new());
        let store = store(&journal);
        for key in ["a", "b", "c", "d", "e"] {
            bump(&store, key, 2).await;
        }

        let projector = Projector::<Tally>::new(&store, None);
        assert_eq!(projector.catch_up().await.expect("catch-up"), 10);
        assert_eq!(projector.catch_up().await.expect("second catch-up"), 0);
        assert_eq!(total(&projector).await, 10);

        let key = EntityKey::new("c");
        let partition = projector.partition_for(&key).await;
        assert_eq!(partition.counts.get("c"), Some(&2));
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let journal = Arc::new(MemoryJournal::new());
        let store = store(&journal);
        bump(&store, "a", 3).await;

        let projector = Projector::<Tally>::new(&store, None);
        let events = journal
            .read_stream(&crate::event::StreamId::of::<Counter>(&EntityKey::new("a")), 1)
            .expect("read_stream");

        for event in &events {
            assert!(projector.deliver(event).await.expect("deliver"));
        }
        for event in &events {
            assert!(!projector.deliver(event).await.expect("redeliver"));
        }
        assert_eq!(total(&projector).await, 3);
    }

    #[tokio::test]
    async fn broker_and_journal_paths_share_the_cursor() {
        let journal = Arc::new(MemoryJournal::new());
        let store = store(&journal);
        bump(&store, "a", 3).await;

        let projector = Projector::<Tally>::new(&store, None);
        let events = journal
            .read_stream(&crate::event::StreamId::of::<Counter>(&EntityKey::new("a")), 1)
            .expect("read_stream");

        assert!(projector.deliver(&events[0]).await.expect("deliver"));
        assert_eq!(projector.catch_up().await.expect("catch-up"), 2);
        assert!(!projector.deliver(&events[2]).await.expect("late delivery"));

        let cursor = projector.cursor(events[2].tag).await.expect("cursor");
        assert_eq!(cursor.offset, events[2].global_position + 1);
        assert_eq!(total(&projector).await, 3);
    }

    #[tokio::test]
    async fn checkpoint_resumes_after_restart() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let journal = Arc::new(MemoryJournal::new());
        let store = store(&journal);
        bump(&store, "a", 2).await;

        let first = Projector::<Tally>::new(&store, Some(dir.path()));
        first.catch_up().await.expect("catch-up");

        bump(&store, "a", 1).await;
        let second = Projector::<Tally>::new(&store, Some(dir.path()));
        assert_eq!(total(&second).await, 2);
        assert_eq!(second.catch_up().await.expect("catch-up"), 1);
        assert_eq!(total(&second).await, 3);
    }

    #[tokio::test]
    async fn corrupt_checkpoint_rebuilds_from_zero() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let journal = Arc::new(MemoryJournal::new());
        let store = store(&journal);
        bump(&store, "a", 2).await;

        let tag = shard_tag(&EntityKey::new("a"), 4);
        let path = dir.path().join(Tally::NAME).join(format!("tag-{tag}.json"));
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, b"{ not json").expect("write");

        let projector = Projector::<Tally>::new(&store, Some(dir.path()));
        assert_eq!(projector.cursor(tag).await.expect("cursor").offset, 0);
        assert_eq!(projector.catch_up().await.expect("catch-up"), 2);
    }

    #[tokio::test]
    async fn spawned_projector_follows_the_journal() {
        let journal = Arc::new(MemoryJournal::new());
        let mut config = RuntimeConfig::default();
        config.projection.poll_interval = Duration::from_millis(10);
        let store = AggregateStore::builder()
            .journal(Arc::clone(&journal))
            .config(config)
            .build();

        let projector = Projector::<Tally>::new(&store, None);
        let handle = projector.clone().spawn();
        bump(&store, "a", 2).await;

        for _ in 0..100 {
            if total(&projector).await == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(total(&projector).await, 2);
        handle.shutdown().await.expect("shutdown should succeed");
        handle.shutdown().await.expect("second shutdown is a no-op");
    }
}
