//! Artifact metadata domain: groups, artifact details, the global group
//! registry, and the catalog read model.

mod catalog;
mod collaborators;
mod details;
mod global;
mod group;
mod model;
mod service;

pub use catalog::{ArtifactCatalog, ArtifactRow, GroupRow};
pub use collaborators::{
    CollaboratorError, GitRemote, GitRemoteValidator, StaticGitRemotes, StaticVersions,
    ValidatedUrl, VersionResolver,
};
pub use details::{
    ARTIFACT_TOPIC, ArtifactDetails, ArtifactDetailsView, DetailsCommand, DetailsError,
    DetailsEvent, DetailsRecord, DetailsReply,
};
pub use global::{
    GLOBAL_KEY, GROUP_CREATED_TOPIC, GlobalCommand, GlobalError, GlobalEvent, GlobalRegistry,
    GlobalReply,
};
pub use group::{GROUP_TOPIC, GroupAggregate, GroupCommand, GroupError, GroupEvent, GroupReply};
pub use model::{ArtifactCoordinates, CoordinatesError, Group};
pub use service::{ArtifactService, GroupRegistration, ServiceError};

use crate::store::AggregateStoreBuilder;

/// Accept forwarded commands for every artifact aggregate.
pub fn register_aggregates(builder: AggregateStoreBuilder) -> AggregateStoreBuilder {
    builder
        .aggregate_type::<ArtifactDetails>()
        .aggregate_type::<GroupAggregate>()
        .aggregate_type::<GlobalRegistry>()
}
