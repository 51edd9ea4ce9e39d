//! Command context and the type-erased envelope used to forward commands
//! between nodes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregate::Aggregate;
use crate::event::EntityKey;

/// Cross-cutting metadata passed alongside a command.
///
/// Carries audit trail and correlation information without polluting the
/// `Command` or `DomainEvent` types. Fields are copied onto
/// [`EventMetadata`](crate::EventMetadata) when events are appended.
///
/// # Examples
///
/// ```
/// use artifact_es::CommandContext;
/// use serde_json::json;
///
/// let ctx = CommandContext::default()
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_metadata(json!({"source": "api"}));
///
/// assert_eq!(ctx.actor.as_deref(), Some("user-42"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// assert!(ctx.metadata.is_some());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identity of the actor issuing the command (e.g. a user ID).
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across nodes.
    pub correlation_id: Option<String>,
    /// Arbitrary metadata forwarded onto each event.
    pub metadata: Option<Value>,
}

impl CommandContext {
    /// Set the actor identity.
    ///
    /// # Arguments
    ///
    /// * `actor` - Who issued the command, such as a user name or the name
    ///   of the calling service. Copied onto every event the command
    ///   persists.
    ///
    /// # Returns
    ///
    /// The context with `actor` set.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    ///
    /// # Arguments
    ///
    /// * `id` - Request identifier carried across nodes when the command is
    ///   forwarded to its shard owner.
    ///
    /// # Returns
    ///
    /// The context with `correlation_id` set.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set arbitrary metadata.
    pub fn with_metadata(mut self, meta: Value) -> Self {
        self.metadata = Some(meta);
        self
    }
}

/// A type-erased command addressed to one aggregate instance.
///
/// This is what crosses the wire when the shard that owns `entity_key` lives
/// on another node. The receiving node looks up the dispatcher registered for
/// `aggregate_type` and deserializes `command` into the concrete
/// `A::Command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Target aggregate type name (must match `Aggregate::AGGREGATE_TYPE`).
    pub aggregate_type: String,
    /// Target aggregate instance key.
    pub entity_key: EntityKey,
    /// JSON-serialized command payload.
    pub command: Value,
    /// Cross-cutting metadata forwarded to the command handler.
    pub context: CommandContext,
}

impl CommandEnvelope {
    /// Wrap a typed command for aggregate `A`.
    ///
    /// # Arguments
    ///
    /// * `key` - Entity the command targets.
    /// * `cmd` - The command, serialized into [`command`](Self::command).
    /// * `context` - Metadata forwarded with the command.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the command cannot be serialized.
    pub fn encode<A>(
        key: &EntityKey,
        cmd: &A::Command,
        context: &CommandContext,
    ) -> serde_json::Result<Self>
    where
        A: Aggregate,
        A::Command: Serialize,
    {
        Ok(Self {
            aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            entity_key: key.clone(),
            command: serde_json::to_value(cmd)?,
            context: context.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterCommand};
    use serde_json::json;

    #[test]
    fn default_context_has_no_fields_set() {
        let ctx = CommandContext::default();
        assert_eq!(ctx.actor, None);
        assert_eq!(ctx.correlation_id, None);
        assert_eq!(ctx.metadata, None);
    }

    #[test]
    fn builder_chains_all_fields() {
        let ctx = CommandContext::default()
            .with_actor("admin")
            .with_correlation_id("req-abc")
            .with_metadata(json!({"source": "test"}));

        assert_eq!(ctx.actor.as_deref(), Some("admin"));
        assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc"));
        assert_eq!(ctx.metadata, Some(json!({"source": "test"})));
    }

    #[test]
    fn encode_stamps_aggregate_type_and_key() {
        let envelope = CommandEnvelope::encode::<Counter>(
            &EntityKey::new("c-1"),
            &CounterCommand::Add(3),
            &CommandContext::default().with_actor("svc"),
        )
        .expect("encode should succeed");

        assert_eq!(envelope.aggregate_type, "counter");
        assert_eq!(envelope.entity_key.as_str(), "c-1");
        assert_eq!(envelope.command, json!({"Add": 3}));
        assert_eq!(envelope.context.actor.as_deref(), Some("svc"));
    }

    #[test]
    fn envelope_survives_the_wire() {
        let envelope = CommandEnvelope::encode::<Counter>(
            &EntityKey::new("c-1"),
            &CounterCommand::Increment,
            &CommandContext::default(),
        )
        .expect("encode should succeed");
        let wire = serde_json::to_string(&envelope).expect("serialize");
        let back: CommandEnvelope = serde_json::from_str(&wire).expect("deserialize");
        assert_eq!(back, envelope);
    }
}
