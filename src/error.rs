//! Crate-level error types.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Error returned when executing a command against an aggregate fails.
///
/// Generic over `E`, the domain-specific error type that the aggregate's
/// command handler may produce (e.g. "artifact not registered").
///
/// Only [`Validation`](ExecuteError::Validation) and
/// [`ConcurrencyConflict`](ExecuteError::ConcurrencyConflict) guarantee that
/// nothing was persisted. After [`Timeout`](ExecuteError::Timeout) or
/// [`Unavailable`](ExecuteError::Unavailable) the outcome is unknown and the
/// caller may retry; aggregates are written so that a retried command is a
/// no-op when its change already holds.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic. Nothing was persisted.
    #[error(transparent)]
    Validation(E),

    /// Optimistic sequence retries exhausted.
    ///
    /// The command was re-run against freshly loaded state the configured
    /// number of times but each append met a concurrent writer.
    #[error("optimistic concurrency conflict: retries exhausted")]
    ConcurrencyConflict,

    /// The owning shard could not be reached, is in handoff, or is not
    /// owned by the node the command was sent to.
    #[error("shard unavailable: {0}")]
    Unavailable(String),

    /// The journal failed while loading or appending.
    #[error("persistence failure: {0}")]
    Persistence(#[from] JournalError),

    /// No reply arrived within the caller's deadline.
    #[error("command timed out; outcome unknown")]
    Timeout,

    /// The aggregate's actor exited before replying.
    #[error("aggregate actor is no longer running")]
    ActorGone,
}

impl<E> ExecuteError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Flatten into the serializable form sent back to a forwarding node.
    pub fn to_remote(&self) -> RemoteFailure
    where
        E: Serialize,
    {
        match self {
            Self::Validation(e) => match serde_json::to_value(e) {
                Ok(error) => RemoteFailure::Validation {
                    error,
                    message: e.to_string(),
                },
                Err(err) => RemoteFailure::Malformed(format!("encode validation error: {err}")),
            },
            Self::ConcurrencyConflict => RemoteFailure::ConcurrencyConflict,
            Self::Unavailable(reason) => RemoteFailure::Unavailable(reason.clone()),
            Self::Persistence(e) => RemoteFailure::Persistence(e.to_string()),
            Self::Timeout => RemoteFailure::Timeout,
            Self::ActorGone => RemoteFailure::Unavailable("aggregate actor is no longer running".into()),
        }
    }

    /// Rebuild the typed error from a remote node's failure.
    pub fn from_remote(failure: RemoteFailure) -> Self
    where
        E: DeserializeOwned,
    {
        match failure {
            RemoteFailure::Validation { error, message } => match serde_json::from_value(error) {
                Ok(e) => Self::Validation(e),
                Err(_) => Self::Unavailable(format!("undecodable remote rejection: {message}")),
            },
            RemoteFailure::ConcurrencyConflict => Self::ConcurrencyConflict,
            RemoteFailure::Unavailable(reason) => Self::Unavailable(reason),
            RemoteFailure::Persistence(reason) => Self::Persistence(JournalError::Backend(reason)),
            RemoteFailure::Timeout => Self::Timeout,
            RemoteFailure::Malformed(reason) => Self::Unavailable(reason),
        }
    }
}

/// Error returned when reading the current state of an aggregate fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The journal failed while loading the aggregate.
    #[error("persistence failure: {0}")]
    Persistence(#[from] JournalError),

    /// The aggregate's actor exited before replying.
    #[error("aggregate actor is no longer running")]
    ActorGone,
}

/// Error returned by an [`EventJournal`](crate::EventJournal) or
/// [`OutboxStore`](crate::OutboxStore).
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// The stream's last sequence number was not the expected one. Nothing
    /// was written.
    #[error("sequence conflict: expected {expected}, stream is at {actual}")]
    Conflict {
        /// Sequence number the writer based its decision on.
        expected: u64,
        /// Sequence number actually found in the journal.
        actual: u64,
    },

    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The journal file holds a damaged record before its final line.
    #[error("corrupt journal record at line {line}: {reason}")]
    Corrupt {
        /// One-based line number of the damaged record.
        line: usize,
        /// Decoder message.
        reason: String,
    },

    /// An opaque failure reported by a remote node's journal.
    #[error("{0}")]
    Backend(String),
}

/// Error returned by a [`Broker`](crate::Broker) publish call.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The broker could not be reached. The record stays in the outbox.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The broker refused the record. The record stays in the outbox.
    #[error("broker rejected record: {0}")]
    Rejected(String),
}

/// Error returned by a [`ClusterTransport`](crate::ClusterTransport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The target node could not be reached.
    #[error("node {0} unreachable")]
    Unreachable(String),

    /// The target node handled the command and it failed there.
    #[error("remote failure: {0}")]
    Remote(RemoteFailure),
}

/// Serializable outcome of a command that failed on a remote node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RemoteFailure {
    /// Domain rejection; `error` is the serialized `A::Error`.
    #[error("command rejected: {message}")]
    Validation {
        /// Serialized domain error.
        error: serde_json::Value,
        /// Its display string, kept for logs when decoding fails.
        message: String,
    },

    /// Optimistic sequence retries exhausted on the owner.
    #[error("optimistic concurrency conflict")]
    ConcurrencyConflict,

    /// The receiving node does not own the shard or is handing it off.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The owner's journal failed.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// The owner timed out.
    #[error("timed out")]
    Timeout,

    /// The envelope or reply could not be (de)serialized.
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Error returned while building a shard table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShardError {
    /// A shard table needs at least one node.
    #[error("membership is empty")]
    EmptyMembership,

    /// A shard table needs at least one shard.
    #[error("shard count must be positive")]
    ZeroShards,

    /// Node ids must not be blank.
    #[error("node id must not be empty")]
    EmptyNodeId,
}

/// Error returned by the projector.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Reading events from the journal failed.
    #[error("journal read failed: {0}")]
    Journal(#[from] JournalError),

    /// Checkpoint file I/O failed.
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A checkpoint or broker message could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A tag catch-up task panicked.
    #[error("catch-up task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
