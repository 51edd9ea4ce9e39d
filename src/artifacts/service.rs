//! Artifact operations composed from the group, details, and registry
//! aggregates.
//!
//! Inputs are checked by the collaborators before a command is issued, so
//! the aggregates only ever see validated URLs and reachable git remotes.

use std::sync::Arc;
use std::time::Duration;

use super::collaborators::{CollaboratorError, GitRemoteValidator, ValidatedUrl, VersionResolver};
use super::details::{
    ArtifactDetails, ArtifactDetailsView, DetailsCommand, DetailsError, DetailsReply,
    check_display_name,
};
use super::global::{GlobalCommand, GlobalError, GlobalRegistry, GlobalReply};
use super::group::{GroupAggregate, GroupCommand, GroupError, GroupReply};
use super::model::{ArtifactCoordinates, CoordinatesError, Group};
use crate::command::CommandContext;
use crate::coordinator::ShardCoordinator;
use crate::error::ExecuteError;

/// Error returned by [`ArtifactService`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Coordinates(#[from] CoordinatesError),

    #[error("group command failed: {0}")]
    Group(#[from] ExecuteError<GroupError>),

    #[error("details command failed: {0}")]
    Details(#[from] ExecuteError<DetailsError>),

    #[error("registry command failed: {0}")]
    Registry(#[from] ExecuteError<GlobalError>),

    /// An aggregate answered with a reply this operation never produces.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// Outcome of [`ArtifactService::register_group`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupRegistration {
    Registered(Group),
    AlreadyRegistered(Group),
}

/// Artifact operations over a [`ShardCoordinator`].
#[derive(Clone)]
pub struct ArtifactService {
    coordinator: Arc<ShardCoordinator>,
    git: Arc<dyn GitRemoteValidator>,
    versions: Arc<dyn VersionResolver>,
    timeout: Duration,
}

impl ArtifactService {
    /// Create a service. Each command waits at most `timeout` for its reply.
    pub fn new(
        coordinator: Arc<ShardCoordinator>,
        git: Arc<dyn GitRemoteValidator>,
        versions: Arc<dyn VersionResolver>,
        timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            git,
            versions,
            timeout,
        }
    }

    /// Register a group and track it in the global registry.
    ///
    /// A malformed group id is rejected before either aggregate sees it.
    /// The registry is updated for already registered groups too, so a
    /// registration interrupted between the two steps converges on retry.
    #[tracing::instrument(skip_all, fields(group_id = %group.group_id))]
    pub async fn register_group(
        &self,
        group: Group,
        ctx: CommandContext,
    ) -> Result<GroupRegistration, ServiceError> {
        group.validate()?;
        let reply = self
            .coordinator
            .execute::<GroupAggregate>(
                &group.entity_key(),
                GroupCommand::Register(group),
                ctx.clone(),
                self.timeout,
            )
            .await?;
        let outcome = match reply {
            GroupReply::Registered(group) => GroupRegistration::Registered(group),
            GroupReply::AlreadyRegistered(group) => GroupRegistration::AlreadyRegistered(group),
            other => return Err(ServiceError::UnexpectedReply(format!("{other:?}"))),
        };
        let tracked = match &outcome {
            GroupRegistration::Registered(group) | GroupRegistration::AlreadyRegistered(group) => {
                group.clone()
            }
        };
        self.coordinator
            .execute::<GlobalRegistry>(
                &GlobalRegistry::key(),
                GlobalCommand::RegisterGroup(tracked),
                ctx,
                self.timeout,
            )
            .await?;
        Ok(outcome)
    }

    /// Every tracked group, in registration order.
    pub async fn groups(&self, ctx: CommandContext) -> Result<Vec<Group>, ServiceError> {
        match self
            .coordinator
            .execute::<GlobalRegistry>(&GlobalRegistry::key(), GlobalCommand::GetGroups, ctx, self.timeout)
            .await?
        {
            GlobalReply::Groups(groups) => Ok(groups),
            other => Err(ServiceError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Add an artifact to its group, then register its details. Returns the
    /// coordinates the details are registered under.
    ///
    /// The display name is checked first, so a rejected registration leaves
    /// the group untouched.
    #[tracing::instrument(skip_all, fields(coordinates = %coordinates))]
    pub async fn register_artifact(
        &self,
        coordinates: ArtifactCoordinates,
        display_name: String,
        ctx: CommandContext,
    ) -> Result<ArtifactCoordinates, ServiceError> {
        check_display_name(&display_name).map_err(ExecuteError::Validation)?;
        let group_key = crate::event::EntityKey::new(coordinates.group_id.clone());
        self.coordinator
            .execute::<GroupAggregate>(
                &group_key,
                GroupCommand::RegisterArtifact {
                    artifact_id: coordinates.artifact_id.clone(),
                },
                ctx.clone(),
                self.timeout,
            )
            .await?;
        let reply = self
            .details(
                &coordinates,
                DetailsCommand::Register {
                    coordinates: coordinates.clone(),
                    display_name,
                },
                ctx,
            )
            .await?;
        match reply {
            DetailsReply::Registered(registered) => Ok(registered),
            other => Err(ServiceError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Registered details of an artifact.
    pub async fn get_details(
        &self,
        coordinates: &ArtifactCoordinates,
        ctx: CommandContext,
    ) -> Result<ArtifactDetailsView, ServiceError> {
        self.details_view(coordinates, DetailsCommand::Get, ctx).await
    }

    pub async fn update_website(
        &self,
        coordinates: &ArtifactCoordinates,
        website: &str,
        ctx: CommandContext,
    ) -> Result<ArtifactDetailsView, ServiceError> {
        let url = ValidatedUrl::parse(website)?;
        self.details_view(coordinates, DetailsCommand::UpdateWebsite(url), ctx)
            .await
    }

    pub async fn update_issues(
        &self,
        coordinates: &ArtifactCoordinates,
        issues: &str,
        ctx: CommandContext,
    ) -> Result<ArtifactDetailsView, ServiceError> {
        let url = ValidatedUrl::parse(issues)?;
        self.details_view(coordinates, DetailsCommand::UpdateIssues(url), ctx)
            .await
    }

    /// Validate `remote` with the git collaborator, then record it.
    pub async fn update_git_repository(
        &self,
        coordinates: &ArtifactCoordinates,
        remote: &str,
        ctx: CommandContext,
    ) -> Result<ArtifactDetailsView, ServiceError> {
        let remote = self.git.validate(remote).await?;
        self.details_view(coordinates, DetailsCommand::UpdateGitRepository(remote), ctx)
            .await
    }

    pub async fn update_display_name(
        &self,
        coordinates: &ArtifactCoordinates,
        display_name: String,
        ctx: CommandContext,
    ) -> Result<ArtifactDetailsView, ServiceError> {
        check_display_name(&display_name).map_err(ExecuteError::Validation)?;
        self.details_view(coordinates, DetailsCommand::UpdateDisplayName(display_name), ctx)
            .await
    }

    /// Published versions of a registered artifact.
    pub async fn versions(
        &self,
        coordinates: &ArtifactCoordinates,
        ctx: CommandContext,
    ) -> Result<Vec<String>, ServiceError> {
        self.get_details(coordinates, ctx).await?;
        Ok(self.versions.versions(coordinates).await?)
    }

    async fn details(
        &self,
        coordinates: &ArtifactCoordinates,
        cmd: DetailsCommand,
        ctx: CommandContext,
    ) -> Result<DetailsReply, ServiceError> {
        Ok(self
            .coordinator
            .execute::<ArtifactDetails>(&coordinates.entity_key(), cmd, ctx, self.timeout)
            .await?)
    }

    async fn details_view(
        &self,
        coordinates: &ArtifactCoordinates,
        cmd: DetailsCommand,
        ctx: CommandContext,
    ) -> Result<ArtifactDetailsView, ServiceError> {
        match self.details(coordinates, cmd, ctx).await? {
            DetailsReply::Details(view) => Ok(view),
            other => Err(ServiceError::UnexpectedReply(format!("{other:?}"))),
        }
    }
}
