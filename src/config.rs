//! Runtime configuration.
//!
//! [`RuntimeConfig`] gathers every tunable of the runtime in one value that a
//! host process builds once (or deserializes from JSON) and hands to
//! [`AggregateStoreBuilder::config`](crate::AggregateStoreBuilder::config).
//! Durations are (de)serialized as integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of virtual shards entity keys are hashed into.
pub const DEFAULT_SHARD_COUNT: u32 = 100;

/// Default number of projection tags events are fanned out over.
pub const DEFAULT_TAG_COUNT: u32 = 10;

/// Top-level runtime configuration.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use artifact_es::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     idle_timeout: Duration::from_secs(30),
///     ..RuntimeConfig::default()
/// };
/// assert_eq!(config.shard_count, 100);
/// assert_eq!(config.idle_timeout, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of virtual shards. Must be identical on every node.
    pub shard_count: u32,

    /// Number of projection tags. Fixed for the lifetime of a journal:
    /// the tag is stamped on each event when it is appended.
    pub tag_count: u32,

    /// How long a resident aggregate may sit idle before it is passivated.
    ///
    /// Default: 5 minutes.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,

    /// Take a snapshot after this many events have been appended since the
    /// previous one. `0` disables count-based snapshots (passivation still
    /// snapshots).
    pub snapshot_every: u64,

    /// How many times a command is re-run against freshly loaded state after
    /// an optimistic sequence conflict before the conflict is surfaced.
    pub max_conflict_retries: u32,

    /// Bounded mailbox size per aggregate instance.
    pub mailbox_capacity: usize,

    /// Outbox publisher settings.
    pub outbox: OutboxConfig,

    /// Projector settings.
    pub projection: ProjectionConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            tag_count: DEFAULT_TAG_COUNT,
            idle_timeout: Duration::from_secs(300),
            snapshot_every: 100,
            max_conflict_retries: 3,
            mailbox_capacity: 32,
            outbox: OutboxConfig::default(),
            projection: ProjectionConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the document is not valid JSON or a
    /// field has the wrong type.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Outbox publisher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Delay between scheduled polls.
    ///
    /// Default: 5 seconds.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,

    /// Maximum number of records read per poll.
    pub batch_size: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 256,
        }
    }
}

/// Projector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Delay between background catch-up passes.
    ///
    /// Default: 1 second.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,

    /// Maximum number of events read from the journal per tag per read.
    pub batch_size: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 512,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
