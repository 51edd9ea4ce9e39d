//! Sharded, event-sourced runtime for artifact metadata.
//!
//! Commands enter through a [`ShardCoordinator`], which runs them on the
//! single live actor for their entity (on whichever node owns the entity's
//! shard). Each actor appends its events to an [`EventJournal`] together
//! with one outbox record per event; an [`OutboxPublisher`] drains those
//! records to a [`Broker`], and [`Projector`]s fold the journal (or the
//! broker feed) into tag-partitioned read models.

mod actor;
pub use actor::AggregateHandle;
mod aggregate;
pub use aggregate::{Aggregate, CommandOutcome, Effect, replay, run_command};
pub mod artifacts;
mod cluster;
mod command;
mod config;
mod coordinator;
mod error;
mod event;
mod journal;
mod outbox;
mod projection;
mod shard;
mod store;

pub use cluster::{ClusterTransport, ForwardedCommand, InMemoryTransport};
pub use command::{CommandContext, CommandEnvelope};
pub use config::{DEFAULT_SHARD_COUNT, DEFAULT_TAG_COUNT, OutboxConfig, ProjectionConfig, RuntimeConfig};
pub use coordinator::{HandoffPlan, ShardCoordinator, rebalance};
pub use error::{
    ExecuteError, JournalError, ProjectionError, PublishError, RemoteFailure, ShardError,
    StateError, TransportError,
};
pub use event::{
    EntityKey, EventMetadata, NewEvent, StoredEvent, StreamId, decode_domain_event,
    encode_domain_event, shard_tag,
};
pub use journal::{
    CommittedRange, EventJournal, FileJournal, MemoryJournal, OutboxStore, Snapshot,
    snapshot_path,
};
pub use outbox::{Broker, InMemoryBroker, OutboxPublisher, OutboxRecord, PublishReport, PublisherHandle};
pub use projection::{Projection, ProjectionCursor, Projector, ProjectorHandle};
pub use shard::{Membership, ShardMove, ShardRoute, ShardTable, shard_for, shard_of, stable_hash};
pub use store::{AggregateStore, AggregateStoreBuilder};
