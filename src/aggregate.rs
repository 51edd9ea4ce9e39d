//! Aggregate trait and the command [`Effect`] it returns.

use serde::{Serialize, de::DeserializeOwned};

use crate::event::EntityKey;

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself is the aggregate's state, and its
/// [`Default`] value is the empty state every instance starts from. State is
/// built by folding domain events through [`apply`](Aggregate::apply).
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) is a pure decision function: no I/O. It
///   inspects the current state and either rejects the command or returns an
///   [`Effect`]. A command whose change is already reflected in state should
///   return a reply-only effect, so that it persists nothing.
/// - [`apply`](Aggregate::apply) is pure and total; every field of the state
///   must be reachable only through it.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. `"details"`). Namespaces journal
    /// streams and command envelopes.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    ///
    /// `Clone` because a command is re-run against fresh state after an
    /// optimistic sequence conflict.
    type Command: Clone + Send + 'static;

    /// The set of events this aggregate can produce and apply.
    ///
    /// Must use adjacently tagged serde (`#[serde(tag = "type", content = "data")]`).
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Successful reply to a command.
    type Reply: Send + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Decide how to respond to a command given the current state.
    fn handle(&self, cmd: Self::Command) -> Result<Effect<Self>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;

    /// Broker topic an event is published under.
    fn topic(event: &Self::DomainEvent) -> &'static str;

    /// Broker ordering key for an event. Defaults to the entity key.
    fn partition_key(key: &EntityKey, _event: &Self::DomainEvent) -> String {
        key.to_string()
    }
}

/// Reply computed from the state after the effect's events are applied.
type ReplyFn<A> = Box<dyn FnOnce(&A) -> <A as Aggregate>::Reply + Send>;

/// What a command does: reply immediately, or persist events and then reply
/// from the new state.
pub enum Effect<A: Aggregate> {
    /// Reply without persisting anything.
    Reply(A::Reply),
    /// Persist `events` as one atomic batch, fold them into state, then
    /// compute the reply from the new state.
    Persist {
        /// Events to append, in order.
        events: Vec<A::DomainEvent>,
        /// Reply builder run against the post-append state.
        reply: ReplyFn<A>,
    },
}

impl<A: Aggregate> Effect<A> {
    /// Reply without persisting anything.
    pub fn reply(reply: A::Reply) -> Self {
        Self::Reply(reply)
    }

    /// Persist `events`, then reply with `reply(&new_state)`.
    pub fn persist(
        events: Vec<A::DomainEvent>,
        reply: impl FnOnce(&A) -> A::Reply + Send + 'static,
    ) -> Self {
        Self::Persist {
            events,
            reply: Box::new(reply),
        }
    }

    /// Persist a single event, then reply with `reply(&new_state)`.
    pub fn persist_one(
        event: A::DomainEvent,
        reply: impl FnOnce(&A) -> A::Reply + Send + 'static,
    ) -> Self {
        Self::persist(vec![event], reply)
    }

    /// Events this effect would persist.
    pub fn events(&self) -> &[A::DomainEvent] {
        match self {
            Self::Reply(_) => &[],
            Self::Persist { events, .. } => events,
        }
    }

    /// Split into events to persist and the deferred reply.
    pub(crate) fn into_parts(self) -> (Vec<A::DomainEvent>, PendingReply<A>) {
        match self {
            Self::Reply(reply) => (Vec::new(), PendingReply::Ready(reply)),
            Self::Persist { events, reply } => (events, PendingReply::After(reply)),
        }
    }
}

/// Reply half of an [`Effect`], resolved once the events are durable.
pub(crate) enum PendingReply<A: Aggregate> {
    Ready(A::Reply),
    After(ReplyFn<A>),
}

impl<A: Aggregate> PendingReply<A> {
    pub(crate) fn resolve(self, state: &A) -> A::Reply {
        match self {
            Self::Ready(reply) => reply,
            Self::After(f) => f(state),
        }
    }
}

/// Result of running a command in memory with [`run_command`].
pub struct CommandOutcome<A: Aggregate> {
    /// State after the command's events were applied.
    pub state: A,
    /// Events the command would have persisted.
    pub events: Vec<A::DomainEvent>,
    /// Reply the caller would have received.
    pub reply: A::Reply,
}

/// Run one command against `state` without any persistence.
///
/// This is exactly what the actor does minus the journal append, which
/// makes it the natural way to unit-test an aggregate's decision logic.
///
/// # Errors
///
/// Returns the aggregate's rejection unchanged.
pub fn run_command<A: Aggregate>(state: A, cmd: A::Command) -> Result<CommandOutcome<A>, A::Error> {
    let (events, reply) = state.handle(cmd)?.into_parts();
    let state = events.iter().fold(state, |s, e| s.apply(e));
    let reply = reply.resolve(&state);
    Ok(CommandOutcome {
        state,
        events,
        reply,
    })
}

/// Fold a sequence of events from the empty state.
pub fn replay<'a, A: Aggregate>(events: impl IntoIterator<Item = &'a A::DomainEvent>) -> A {
    events.into_iter().fold(A::default(), |s, e| s.apply(e))
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::{Aggregate, Effect};
    use serde::{Deserialize, Serialize};

    /// A simple counter aggregate used as a test fixture.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Counter {
        pub value: u64,
    }

    /// Commands that can be issued to the `Counter` aggregate.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) enum CounterCommand {
        Increment,
        Decrement,
        Add(u64),
        /// Set the value; a no-op when it already holds.
        Set(u64),
        Get,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum CounterEvent {
        Incremented,
        Decremented,
        Added { amount: u64 },
    }

    #[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
    pub(crate) enum CounterError {
        #[error("cannot decrement: counter is already zero")]
        AlreadyZero,
    }

    impl Aggregate for Counter {
        const AGGREGATE_TYPE: &'static str = "counter";

        type Command = CounterCommand;
        type DomainEvent = CounterEvent;
        type Reply = u64;
        type Error = CounterError;

        fn handle(&self, cmd: Self::Command) -> Result<Effect<Self>, Self::Error> {
            match cmd {
                CounterCommand::Increment => {
                    Ok(Effect::persist_one(CounterEvent::Incremented, |s: &Counter| s.value))
                }
                CounterCommand::Decrement => {
                    if self.value == 0 {
                        return Err(CounterError::AlreadyZero);
                    }
                    Ok(Effect::persist_one(CounterEvent::Decremented, |s: &Counter| s.value))
                }
                CounterCommand::Add(n) => {
                    Ok(Effect::persist_one(CounterEvent::Added { amount: n }, |s: &Counter| s.value))
                }
                CounterCommand::Set(n) if n == self.value => Ok(Effect::reply(self.value)),
                CounterCommand::Set(n) if n > self.value => Ok(Effect::persist_one(
                    CounterEvent::Added {
                        amount: n - self.value,
                    },
                    |s: &Counter| s.value,
                )),
                CounterCommand::Set(n) => {
                    let events = (n..self.value).map(|_| CounterEvent::Decremented).collect();
                    Ok(Effect::persist(events, |s: &Counter| s.value))
                }
                CounterCommand::Get => Ok(Effect::reply(self.value)),
            }
        }

        fn apply(mut self, event: &Self::DomainEvent) -> Self {
            match event {
                CounterEvent::Incremented => self.value += 1,
                CounterEvent::Decremented => self.value -= 1,
                CounterEvent::Added { amount } => self.value += amount,
            }
            self
        }

        fn topic(_event: &Self::DomainEvent) -> &'static str {
            "counter-events"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::{Counter, CounterCommand, CounterError, CounterEvent};
    use super::*;

    #[test]
    fn increment_persists_one_event_and_replies_new_value() {
        let outcome = run_command(Counter::default(), CounterCommand::Increment)
            .expect("increment should succeed");
        assert_eq!(outcome.events, vec![CounterEvent::Incremented]);
        assert_eq!(outcome.reply, 1);
        assert_eq!(outcome.state.value, 1);
    }

    #[test]
    fn decrement_at_zero_is_rejected() {
        let result = run_command(Counter::default(), CounterCommand::Decrement);
        assert!(matches!(result, Err(CounterError::AlreadyZero)));
    }

    #[test]
    fn set_to_current_value_is_reply_only() {
        let effect = Counter { value: 4 }
            .handle(CounterCommand::Set(4))
            .expect("set should succeed");
        assert!(effect.events().is_empty());
        assert!(matches!(effect, Effect::Reply(4)));
    }

    #[test]
    fn set_downwards_emits_one_event_per_step() {
        let outcome =
            run_command(Counter { value: 5 }, CounterCommand::Set(2)).expect("set should succeed");
        assert_eq!(outcome.events.len(), 3);
        assert_eq!(outcome.reply, 2);
    }

    #[test]
    fn replay_matches_incremental_application() {
        let events = vec![
            CounterEvent::Added { amount: 5 },
            CounterEvent::Decremented,
            CounterEvent::Incremented,
        ];
        let state: Counter = replay(&events);
        assert_eq!(state.value, 5);
    }

    #[test]
    fn default_partition_key_is_entity_key() {
        let key = EntityKey::new("c-7");
        assert_eq!(Counter::partition_key(&key, &CounterEvent::Incremented), "c-7");
    }
}
