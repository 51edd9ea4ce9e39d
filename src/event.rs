//! Event identity, encoding, and decoding.
//!
//! This module holds the data types every other layer shares: the
//! [`EntityKey`] and [`StreamId`] that address one aggregate instance, the
//! [`NewEvent`] an actor hands to the journal, and the [`StoredEvent`] the
//! journal hands back (to replay, to the outbox, and to projections). No I/O
//! happens here.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::command::CommandContext;

/// Stable string identity of one aggregate instance, e.g.
/// `"org.spongepowered:example"`.
///
/// Used for shard placement, journal partitioning, and (through the
/// aggregate's partition key) broker ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    /// Wrap a string as an entity key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for EntityKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Journal address of one aggregate instance: its type plus its key.
///
/// Two aggregate types may use the same key string (the global registry and
/// a group could both be called `"global"`); the stream id keeps their
/// histories apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    /// Aggregate type name (`Aggregate::AGGREGATE_TYPE`).
    pub aggregate_type: String,
    /// Instance key within that type.
    pub key: EntityKey,
}

impl StreamId {
    /// Build a stream id from its parts.
    pub fn new(aggregate_type: impl Into<String>, key: EntityKey) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            key,
        }
    }

    /// Build the stream id of aggregate type `A` at `key`.
    pub fn of<A: Aggregate>(key: &EntityKey) -> Self {
        Self::new(A::AGGREGATE_TYPE, key.clone())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.aggregate_type, self.key)
    }
}

/// Projection tag of an entity: a stable hash of its key modulo `tag_count`.
///
/// The tag is stamped on every event at append time, so all events of one
/// entity land in the same projection partition.
pub fn shard_tag(key: &EntityKey, tag_count: u32) -> u32 {
    if tag_count == 0 {
        return 0;
    }
    (crate::shard::stable_hash(&[key.as_str()]) % u64::from(tag_count)) as u32
}

/// Infrastructure metadata stamped on every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Identity of whoever issued the command, if provided.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub actor: Option<String>,
    /// Correlation ID from the command context, if provided.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
    /// Free-form metadata from the command context.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extra: Option<serde_json::Value>,
}

/// An event produced by a command, not yet assigned a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Fresh UUID v4 identity; survives into the stored event and every
    /// outbox delivery, so consumers can dedupe on it.
    pub event_id: Uuid,
    /// Variant name from the adjacently tagged domain event.
    pub event_type: String,
    /// The `"data"` part of the domain event (`null` for unit variants).
    pub payload: serde_json::Value,
    /// Broker topic for the outbox record of this event.
    pub topic: String,
    /// Broker ordering key for the outbox record of this event.
    pub partition_key: String,
    /// Context metadata.
    pub metadata: EventMetadata,
}

/// An event as recorded in the journal.
///
/// This is also the payload of every outbox record, so broker consumers
/// receive exactly what journal readers receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Client-assigned event identity.
    pub event_id: Uuid,
    /// Aggregate type that produced the event.
    pub aggregate_type: String,
    /// Instance key that produced the event.
    pub entity_key: EntityKey,
    /// One-based sequence number within the entity's stream.
    pub sequence: u64,
    /// Zero-based position in the journal-wide log.
    pub global_position: u64,
    /// Projection tag (see [`shard_tag`]).
    pub tag: u32,
    /// Variant name of the domain event.
    pub event_type: String,
    /// Domain event data.
    pub payload: serde_json::Value,
    /// Context metadata.
    pub metadata: EventMetadata,
    /// Append time, Unix epoch milliseconds.
    pub recorded_at: u64,
}

impl StoredEvent {
    /// Returns the stream this event belongs to.
    pub fn stream_id(&self) -> StreamId {
        StreamId::new(self.aggregate_type.clone(), self.entity_key.clone())
    }
}

/// Encode a domain event into a [`NewEvent`] ready for the journal.
///
/// The domain event must use adjacently tagged serde
/// (`#[serde(tag = "type", content = "data")]`); `"type"` becomes
/// `event_type` and `"data"` (absent for unit variants) becomes the payload.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized or does not
/// serialize to an adjacently tagged object.
pub fn encode_domain_event<A: Aggregate>(
    event: &A::DomainEvent,
    ctx: &CommandContext,
    key: &EntityKey,
) -> serde_json::Result<NewEvent> {
    use serde::ser::Error as _;

    let value = serde_json::to_value(event)?;
    let obj = value
        .as_object()
        .ok_or_else(|| serde_json::Error::custom("domain event must serialize to an object"))?;
    let event_type = obj
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| serde_json::Error::custom("domain event must carry a string 'type'"))?
        .to_owned();
    let payload = obj.get("data").cloned().unwrap_or(serde_json::Value::Null);

    Ok(NewEvent {
        event_id: Uuid::new_v4(),
        event_type,
        payload,
        topic: A::topic(event).to_owned(),
        partition_key: A::partition_key(key, event),
        metadata: EventMetadata {
            actor: ctx.actor.clone(),
            correlation_id: ctx.correlation_id.clone(),
            extra: ctx.metadata.clone(),
        },
    })
}

/// Decode a stored event back into `A::DomainEvent`.
///
/// Returns `None` for events of another aggregate type or of an unknown
/// variant, so readers stay forward compatible.
pub fn decode_domain_event<A: Aggregate>(event: &StoredEvent) -> Option<A::DomainEvent> {
    if event.aggregate_type != A::AGGREGATE_TYPE {
        return None;
    }
    let tagged = if event.payload.is_null() {
        serde_json::json!({ "type": event.event_type })
    } else {
        serde_json::json!({ "type": event.event_type, "data": event.payload })
    };
    serde_json::from_value(tagged).ok()
}

/// Current time as Unix epoch milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
