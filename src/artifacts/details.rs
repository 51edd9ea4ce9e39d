//! Per-artifact details aggregate, keyed by `group:artifact`.
//!
//! `Empty` until the first `Register`; every later `Register` is answered
//! with the originally registered coordinates and persists nothing. Field
//! updates are only accepted once registered, and an update to the value
//! already held persists nothing.

use serde::{Deserialize, Serialize};

use super::collaborators::{GitRemote, ValidatedUrl};
use super::model::ArtifactCoordinates;
use crate::aggregate::{Aggregate, Effect};

/// Broker topic for every details event.
pub const ARTIFACT_TOPIC: &str = "ArtifactsArtifactUpserted";

/// Registered artifact metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailsRecord {
    pub coordinates: ArtifactCoordinates,
    pub display_name: String,
    pub website: String,
    pub issues: String,
    pub git_repository: String,
}

/// State of one artifact's details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactDetails {
    #[default]
    Empty,
    Populated(DetailsRecord),
}

impl ArtifactDetails {
    /// The record, once registered.
    pub fn record(&self) -> Option<&DetailsRecord> {
        match self {
            Self::Empty => None,
            Self::Populated(record) => Some(record),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DetailsCommand {
    /// Register the artifact. First write wins.
    Register {
        coordinates: ArtifactCoordinates,
        display_name: String,
    },
    UpdateWebsite(ValidatedUrl),
    UpdateIssues(ValidatedUrl),
    UpdateGitRepository(GitRemote),
    UpdateDisplayName(String),
    Get,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DetailsEvent {
    ArtifactRegistered {
        coordinates: ArtifactCoordinates,
        display_name: String,
    },
    WebsiteUpdated {
        website: String,
    },
    IssuesUpdated {
        issues: String,
    },
    GitRepositoryUpdated {
        git_repository: String,
    },
    DisplayNameUpdated {
        display_name: String,
    },
}

/// Public view of a registered artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDetailsView {
    pub artifact_id: String,
    pub display_name: String,
    pub website: String,
    pub issues: String,
    pub git_repository: String,
}

impl From<&DetailsRecord> for ArtifactDetailsView {
    fn from(record: &DetailsRecord) -> Self {
        Self {
            artifact_id: record.coordinates.artifact_id.clone(),
            display_name: record.display_name.clone(),
            website: record.website.clone(),
            issues: record.issues.clone(),
            git_repository: record.git_repository.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DetailsReply {
    /// Coordinates the artifact is registered under.
    Registered(ArtifactCoordinates),
    Details(ArtifactDetailsView),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum DetailsError {
    #[error("artifact is not registered")]
    NotRegistered,
    #[error("display name must not be blank")]
    InvalidDisplayName,
}

/// Display names must contain something other than whitespace.
pub(crate) fn check_display_name(name: &str) -> Result<(), DetailsError> {
    if name.trim().is_empty() {
        return Err(DetailsError::InvalidDisplayName);
    }
    Ok(())
}

fn view(state: &ArtifactDetails) -> DetailsReply {
    DetailsReply::Details(state.record().map(ArtifactDetailsView::from).unwrap_or_default())
}

impl ArtifactDetails {
    fn update(
        record: &DetailsRecord,
        current: &str,
        next: String,
        event: impl FnOnce(String) -> DetailsEvent,
    ) -> Effect<Self> {
        if current == next {
            return Effect::reply(DetailsReply::Details(record.into()));
        }
        Effect::persist_one(event(next), view)
    }
}

impl Aggregate for ArtifactDetails {
    const AGGREGATE_TYPE: &'static str = "details";

    type Command = DetailsCommand;
    type DomainEvent = DetailsEvent;
    type Reply = DetailsReply;
    type Error = DetailsError;

    fn handle(&self, cmd: Self::Command) -> Result<Effect<Self>, Self::Error> {
        let record = match self {
            Self::Populated(record) => record,
            Self::Empty => {
                let DetailsCommand::Register {
                    coordinates,
                    display_name,
                } = cmd
                else {
                    return Err(DetailsError::NotRegistered);
                };
                check_display_name(&display_name)?;
                let reply = DetailsReply::Registered(coordinates.clone());
                return Ok(Effect::persist_one(
                    DetailsEvent::ArtifactRegistered {
                        coordinates,
                        display_name,
                    },
                    move |_| reply,
                ));
            }
        };

        Ok(match cmd {
            DetailsCommand::Register { .. } => {
                Effect::reply(DetailsReply::Registered(record.coordinates.clone()))
            }
            DetailsCommand::UpdateWebsite(url) => {
                Self::update(record, &record.website, url.to_string(), |website| {
                    DetailsEvent::WebsiteUpdated { website }
                })
            }
            DetailsCommand::UpdateIssues(url) => {
                Self::update(record, &record.issues, url.to_string(), |issues| {
                    DetailsEvent::IssuesUpdated { issues }
                })
            }
            DetailsCommand::UpdateGitRepository(remote) => {
                Self::update(record, &record.git_repository, remote.url, |git_repository| {
                    DetailsEvent::GitRepositoryUpdated { git_repository }
                })
            }
            DetailsCommand::UpdateDisplayName(name) => {
                check_display_name(&name)?;
                Self::update(record, &record.display_name, name, |display_name| {
                    DetailsEvent::DisplayNameUpdated { display_name }
                })
            }
            DetailsCommand::Get => Effect::reply(DetailsReply::Details(record.into())),
        })
    }

    fn apply(self, event: &Self::DomainEvent) -> Self {
        match (self, event) {
            (
                Self::Empty,
                DetailsEvent::ArtifactRegistered {
                    coordinates,
                    display_name,
                },
            ) => Self::Populated(DetailsRecord {
                coordinates: coordinates.clone(),
                display_name: display_name.clone(),
                website: String::new(),
                issues: String::new(),
                git_repository: String::new(),
            }),
            (Self::Populated(mut record), event) => {
                match event {
                    DetailsEvent::ArtifactRegistered { .. } => {}
                    DetailsEvent::WebsiteUpdated { website } => record.website = website.clone(),
                    DetailsEvent::IssuesUpdated { issues } => record.issues = issues.clone(),
                    DetailsEvent::GitRepositoryUpdated { git_repository } => {
                        record.git_repository = git_repository.clone();
                    }
                    DetailsEvent::DisplayNameUpdated { display_name } => {
                        record.display_name = display_name.clone();
                    }
                }
                Self::Populated(record)
            }
            (Self::Empty, _) => Self::Empty,
        }
    }

    fn topic(_event: &Self::DomainEvent) -> &'static str {
        ARTIFACT_TOPIC
    }
}
