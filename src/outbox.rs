//! Transactional outbox publishing.
//!
//! The journal writes one [`OutboxRecord`] per event in the same commit as
//! the event. [`OutboxPublisher`] drains those records to a [`Broker`] in id
//! order and deletes each one only after the broker acknowledged it, so every
//! committed event is published at least once and records sharing a
//! partition key are published in commit order.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::OutboxConfig;
use crate::error::{JournalError, PublishError};
use crate::event::StoredEvent;
use crate::journal::OutboxStore;

/// A message waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Monotonic id assigned at commit; defines publish order.
    pub id: u64,
    /// Broker topic.
    pub topic: String,
    /// Broker ordering key.
    pub partition_key: String,
    /// The serialized [`StoredEvent`].
    pub payload: serde_json::Value,
    /// Commit time, Unix epoch milliseconds.
    pub created_at: u64,
}

impl OutboxRecord {
    /// Decode the payload back into the stored event it was written from.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload is not a stored event.
    pub fn decode_event(&self) -> serde_json::Result<StoredEvent> {
        StoredEvent::deserialize(&self.payload)
    }
}

/// Destination for outbox records.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish one record. `Ok` means the broker has taken responsibility for
    /// it and the record may be deleted from the outbox.
    async fn publish(&self, record: &OutboxRecord) -> Result<(), PublishError>;
}

#[derive(Default)]
struct BrokerState {
    delivered: Vec<OutboxRecord>,
    unavailable: bool,
    fail_next: usize,
}

/// Broker that keeps delivered records in memory.
///
/// Clones share state. Subscribers registered with
/// [`subscribe`](InMemoryBroker::subscribe) receive every record accepted
/// after they subscribed.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    feed: broadcast::Sender<OutboxRecord>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create an available broker with no deliveries.
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            feed,
        }
    }

    /// Make every publish fail with [`PublishError::Unreachable`] while
    /// `false`.
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Reject the next `n` publishes with [`PublishError::Rejected`].
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Every record accepted so far, in acceptance order.
    pub fn delivered(&self) -> Vec<OutboxRecord> {
        self.lock().delivered.clone()
    }

    /// Receive records as they are accepted.
    pub fn subscribe(&self) -> broadcast::Receiver<OutboxRecord> {
        self.feed.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, record: &OutboxRecord) -> Result<(), PublishError> {
        {
            let mut state = self.lock();
            if state.unavailable {
                return Err(PublishError::Unreachable("in-memory broker offline".into()));
            }
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(PublishError::Rejected(format!("record {}", record.id)));
            }
            state.delivered.push(record.clone());
        }
        // No subscribers is fine.
        let _ = self.feed.send(record.clone());
        Ok(())
    }
}

/// Outcome of one publisher poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Records published and deleted.
    pub published: usize,
    /// `true` if the poll stopped at a record the broker refused.
    pub stalled: bool,
}

/// Drains the outbox to a broker.
pub struct OutboxPublisher {
    outbox: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    config: OutboxConfig,
}

impl OutboxPublisher {
    /// Create a publisher over `outbox`.
    pub fn new(outbox: Arc<dyn OutboxStore>, broker: Arc<dyn Broker>, config: OutboxConfig) -> Self {
        Self {
            outbox,
            broker,
            config,
        }
    }

    /// Publish up to one batch of pending records, oldest first.
    ///
    /// Stops at the first record the broker refuses, leaving it and every
    /// later record in the outbox, so that a partition key never publishes
    /// out of order.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the outbox cannot be read or a delivered
    /// record cannot be deleted. A record whose delete failed is published
    /// again on the next poll.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn run_once(&self) -> Result<PublishReport, JournalError> {
        let batch = self.outbox.pending(self.config.batch_size)?;
        let mut report = PublishReport::default();
        for record in batch {
            match self.broker.publish(&record).await {
                Ok(()) => {
                    self.outbox.delete(record.id)?;
                    report.published += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        record_id = record.id,
                        topic = %record.topic,
                        error = %e,
                        "publish failed; record stays in outbox"
                    );
                    report.stalled = true;
                    break;
                }
            }
        }
        if report.published > 0 || report.stalled {
            tracing::info!(
                published = report.published,
                stalled = report.stalled,
                "outbox poll"
            );
        }
        Ok(report)
    }

    /// Poll every `poll_interval`, and immediately whenever
    /// [`PublisherHandle::trigger`] is called, until shut down.
    pub fn spawn(self) -> PublisherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let trigger = Arc::new(Notify::new());
        let task = tokio::spawn(self.run(Arc::clone(&trigger), shutdown_rx));
        PublisherHandle {
            trigger,
            shutdown_tx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    async fn run(self, trigger: Arc<Notify>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = trigger.notified() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            if *shutdown_rx.borrow() {
                return;
            }
            if let Err(e) = self.run_once().await {
                tracing::error!(error = %e, "outbox poll failed");
            }
        }
    }
}

/// Control handle for a spawned [`OutboxPublisher`].
#[derive(Clone)]
pub struct PublisherHandle {
    trigger: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl PublisherHandle {
    /// Poll now instead of waiting for the next interval.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop the loop and wait for it to exit. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the `JoinError` if the loop panicked.
    pub async fn shutdown(&self) -> Result<(), tokio::task::JoinError> {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle.await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EntityKey, EventMetadata, NewEvent, StreamId};
    use crate::journal::{EventJournal, MemoryJournal};
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn seeded(n: u64) -> Arc<MemoryJournal> {
        let journal = Arc::new(MemoryJournal::new());
        let stream = StreamId::new("counter", EntityKey::new("c-1"));
        let events = (0..n)
            .map(|i| NewEvent {
                event_id: Uuid::new_v4(),
                event_type: "Added".into(),
                payload: json!({ "amount": i }),
                topic: "counter-events".into(),
                partition_key: "c-1".into(),
                metadata: EventMetadata::default(),
            })
            .collect();
        journal.append(&stream, 0, 0, events).expect("append");
        journal
    }

    fn publisher(journal: &Arc<MemoryJournal>, broker: &InMemoryBroker) -> OutboxPublisher {
        OutboxPublisher::new(
            Arc::clone(journal) as Arc<dyn OutboxStore>,
            Arc::new(broker.clone()),
            OutboxConfig {
                poll_interval: Duration::from_millis(10),
                batch_size: 100,
            },
        )
    }

    #[tokio::test]
    async fn successful_publish_deletes_records_in_order() {
        let journal = seeded(3);
        let broker = InMemoryBroker::new();

        let report = publisher(&journal, &broker)
            .run_once()
            .await
            .expect("poll should succeed");

        assert_eq!(report, PublishReport { published: 3, stalled: false });
        assert_eq!(journal.pending_count().expect("pending_count"), 0);
        let delivered = broker.delivered();
        let sequences: Vec<u64> = delivered
            .iter()
            .map(|r| r.decode_event().expect("decode").sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn unavailable_broker_keeps_every_record() {
        let journal = seeded(2);
        let broker = InMemoryBroker::new();
        broker.set_available(false);

        let report = publisher(&journal, &broker)
            .run_once()
            .await
            .expect("poll should succeed");

        assert!(report.stalled);
        assert_eq!(report.published, 0);
        assert_eq!(journal.pending_count().expect("pending_count"), 2);
        assert!(broker.delivered().is_empty());
    }

    #[tokio::test]
    async fn rejection_stops_the_batch_and_later_poll_resumes() {
        let journal = seeded(3);
        let broker = InMemoryBroker::new();
        let publisher = publisher(&journal, &broker);

        broker.fail_next(1);
        let report = publisher.run_once().await.expect("poll should succeed");
        assert_eq!(report, PublishReport { published: 0, stalled: true });
        assert_eq!(journal.pending_count().expect("pending_count"), 3);

        let report = publisher.run_once().await.expect("poll should succeed");
        assert_eq!(report.published, 3);
        assert_eq!(journal.pending_count().expect("pending_count"), 0);
    }

    #[tokio::test]
    async fn spawned_publisher_drains_and_shuts_down() {
        let journal = seeded(2);
        let broker = InMemoryBroker::new();
        let handle = publisher(&journal, &broker).spawn();

        handle.trigger();
        for _ in 0..100 {
            if journal.pending_count().expect("pending_count") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(journal.pending_count().expect("pending_count"), 0);

        handle.shutdown().await.expect("shutdown should succeed");
        handle.shutdown().await.expect("second shutdown is a no-op");
    }

    #[tokio::test]
    async fn subscribers_see_accepted_records() {
        let journal = seeded(1);
        let broker = InMemoryBroker::new();
        let mut feed = broker.subscribe();

        publisher(&journal, &broker).run_once().await.expect("poll");

        let record = feed.recv().await.expect("record should arrive");
        assert_eq!(record.topic, "counter-events");
        assert_eq!(record.partition_key, "c-1");
    }
}
