//! Cluster-wide registry of known groups: a single instance at key
//! [`GLOBAL_KEY`].

use serde::{Deserialize, Serialize};

use super::model::Group;
use crate::aggregate::{Aggregate, Effect};
use crate::event::EntityKey;

/// Entity key of the one registry instance.
pub const GLOBAL_KEY: &str = "global";

/// Broker topic for registry events.
pub const GROUP_CREATED_TOPIC: &str = "GroupCreated";

/// Every registered group, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalRegistry {
    groups: Vec<Group>,
}

impl GlobalRegistry {
    /// Entity key of the registry.
    pub fn key() -> EntityKey {
        EntityKey::new(GLOBAL_KEY)
    }

    /// Tracked groups, in registration order.
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    fn find(&self, group_id: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.group_id == group_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GlobalCommand {
    /// Track a group. Tracking an already tracked group id is a no-op.
    RegisterGroup(Group),
    GetGroups,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GlobalEvent {
    GroupRegistered { group: Group },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GlobalReply {
    /// The group as tracked.
    Registered(Group),
    Groups(Vec<Group>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum GlobalError {
    #[error("group id must not be blank")]
    BlankGroupId,
}

impl Aggregate for GlobalRegistry {
    const AGGREGATE_TYPE: &'static str = "global";

    type Command = GlobalCommand;
    type DomainEvent = GlobalEvent;
    type Reply = GlobalReply;
    type Error = GlobalError;

    fn handle(&self, cmd: Self::Command) -> Result<Effect<Self>, Self::Error> {
        match cmd {
            GlobalCommand::RegisterGroup(group) => {
                if group.group_id.trim().is_empty() {
                    return Err(GlobalError::BlankGroupId);
                }
                if let Some(existing) = self.find(&group.group_id) {
                    return Ok(Effect::reply(GlobalReply::Registered(existing.clone())));
                }
                let reply = GlobalReply::Registered(group.clone());
                Ok(Effect::persist_one(
                    GlobalEvent::GroupRegistered { group },
                    move |_| reply,
                ))
            }
            GlobalCommand::GetGroups => Ok(Effect::reply(GlobalReply::Groups(self.groups.clone()))),
        }
    }

    fn apply(mut self, event: &Self::DomainEvent) -> Self {
        match event {
            GlobalEvent::GroupRegistered { group } => {
                if self.find(&group.group_id).is_none() {
                    self.groups.push(group.clone());
                }
            }
        }
        self
    }

    fn topic(_event: &Self::DomainEvent) -> &'static str {
        GROUP_CREATED_TOPIC
    }

    fn partition_key(_key: &EntityKey, event: &Self::DomainEvent) -> String {
        match event {
            GlobalEvent::GroupRegistered { group } => group.group_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::run_command;

    fn sponge() -> Group {
        Group::new("org.spongepowered", "SpongePowered", "https://spongepowered.org/")
    }

    #[test]
    fn register_group_twice_persists_once() {
        let first = run_command(GlobalRegistry::default(), GlobalCommand::RegisterGroup(sponge()))
            .expect("first register should succeed");
        assert_eq!(first.events.len(), 1);
        assert_eq!(first.reply, GlobalReply::Registered(sponge()));

        let second = run_command(first.state, GlobalCommand::RegisterGroup(sponge()))
            .expect("second register should succeed");
        assert!(second.events.is_empty());
        assert_eq!(second.reply, GlobalReply::Registered(sponge()));
        assert_eq!(second.state.groups(), &[sponge()]);
    }

    #[test]
    fn groups_keep_registration_order() {
        let other = Group::new("com.example", "Example", "https://example.com/");
        let state = [sponge(), other.clone()]
            .into_iter()
            .fold(GlobalRegistry::default(), |state, group| {
                run_command(state, GlobalCommand::RegisterGroup(group))
                    .expect("register should succeed")
                    .state
            });

        let outcome = run_command(state, GlobalCommand::GetGroups).expect("get should succeed");
        assert_eq!(outcome.reply, GlobalReply::Groups(vec![sponge(), other]));
    }

    #[test]
    fn blank_group_id_is_rejected() {
        let result = run_command(
            GlobalRegistry::default(),
            GlobalCommand::RegisterGroup(Group::new(" ", "x", "https://x.org/")),
        );
        assert_eq!(result.err(), Some(GlobalError::BlankGroupId));
    }

    #[test]
    fn events_partition_by_group_id() {
        let event = GlobalEvent::GroupRegistered { group: sponge() };
        assert_eq!(
            GlobalRegistry::partition_key(&GlobalRegistry::key(), &event),
            "org.spongepowered"
        );
        assert_eq!(GlobalRegistry::topic(&event), "GroupCreated");
    }
}
