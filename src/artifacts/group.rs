//! Per-group aggregate, keyed by group id. Tracks the group's metadata and
//! the ids of artifacts registered under it.

use serde::{Deserialize, Serialize};

use super::model::{ArtifactCoordinates, Group};
use crate::aggregate::{Aggregate, Effect};

/// Broker topic for group events.
pub const GROUP_TOPIC: &str = "ArtifactsGroupUpserted";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupAggregate {
    #[default]
    Empty,
    Populated {
        group: Group,
        /// Artifact ids, in registration order.
        artifacts: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupCommand {
    Register(Group),
    RegisterArtifact { artifact_id: String },
    GetGroup,
    GetArtifacts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GroupEvent {
    GroupRegistered { group: Group },
    ArtifactAdded { artifact_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupReply {
    Registered(Group),
    /// The group already existed; carries the stored record.
    AlreadyRegistered(Group),
    ArtifactRegistered(ArtifactCoordinates),
    ArtifactAlreadyRegistered(ArtifactCoordinates),
    Group(Group),
    Artifacts(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum GroupError {
    #[error("group is not registered")]
    GroupMissing,
    #[error("invalid group id {0:?}")]
    InvalidGroupId(String),
    #[error("invalid artifact id {0:?}")]
    InvalidArtifactId(String),
}

impl GroupAggregate {
    fn register_artifact(
        group: &Group,
        artifacts: &[String],
        artifact_id: String,
    ) -> Result<Effect<Self>, GroupError> {
        let coordinates = ArtifactCoordinates::new(group.group_id.clone(), artifact_id.clone())
            .map_err(|_| GroupError::InvalidArtifactId(artifact_id.clone()))?;
        if artifacts.contains(&artifact_id) {
            return Ok(Effect::reply(GroupReply::ArtifactAlreadyRegistered(coordinates)));
        }
        Ok(Effect::persist_one(
            GroupEvent::ArtifactAdded { artifact_id },
            move |_| GroupReply::ArtifactRegistered(coordinates),
        ))
    }
}

impl Aggregate for GroupAggregate {
    const AGGREGATE_TYPE: &'static str = "group";

    type Command = GroupCommand;
    type DomainEvent = GroupEvent;
    type Reply = GroupReply;
    type Error = GroupError;

    fn handle(&self, cmd: Self::Command) -> Result<Effect<Self>, Self::Error> {
        let Self::Populated { group, artifacts } = self else {
            return match cmd {
                GroupCommand::Register(group) => {
                    if group.validate().is_err() {
                        return Err(GroupError::InvalidGroupId(group.group_id));
                    }
                    let reply = GroupReply::Registered(group.clone());
                    Ok(Effect::persist_one(
                        GroupEvent::GroupRegistered { group },
                        move |_| reply,
                    ))
                }
                _ => Err(GroupError::GroupMissing),
            };
        };

        match cmd {
            GroupCommand::Register(_) => Ok(Effect::reply(GroupReply::AlreadyRegistered(group.clone()))),
            GroupCommand::RegisterArtifact { artifact_id } => {
                Self::register_artifact(group, artifacts, artifact_id)
            }
            GroupCommand::GetGroup => Ok(Effect::reply(GroupReply::Group(group.clone()))),
            GroupCommand::GetArtifacts => Ok(Effect::reply(GroupReply::Artifacts(artifacts.clone()))),
        }
    }

    fn apply(self, event: &Self::DomainEvent) -> Self {
        match (self, event) {
            (Self::Empty, GroupEvent::GroupRegistered { group }) => Self::Populated {
                group: group.clone(),
                artifacts: Vec::new(),
            },
            (
                Self::Populated {
                    group,
                    mut artifacts,
                },
                GroupEvent::ArtifactAdded { artifact_id },
            ) => {
                if !artifacts.contains(artifact_id) {
                    artifacts.push(artifact_id.clone());
                }
                Self::Populated { group, artifacts }
            }
            (state, _) => state,
        }
    }

    fn topic(_event: &Self::DomainEvent) -> &'static str {
        GROUP_TOPIC
    }
}
