//! Queryable read model of artifacts and groups.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::details::{ArtifactDetails, DetailsEvent};
use super::group::{GroupAggregate, GroupEvent};
use super::model::ArtifactCoordinates;
use crate::event::{StoredEvent, decode_domain_event};
use crate::projection::Projection;

/// One row of the `artifacts` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRow {
    pub group_id: String,
    pub artifact_id: String,
    pub display_name: String,
    pub website: String,
    pub git_repository: String,
    pub issues: String,
}

/// One row of the `groups` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRow {
    pub group_id: String,
    pub name: String,
    pub website: String,
    /// Artifact ids, in the order they were added.
    pub artifacts: Vec<String>,
    /// Ids of the `ArtifactAdded` events already folded into `artifacts`.
    absorbed: BTreeSet<Uuid>,
}

/// Artifacts keyed by `group:artifact`, groups keyed by group id.
///
/// Field-set events overwrite their column, so replaying them is harmless.
/// Artifact list appends are deduplicated by event id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactCatalog {
    artifacts: BTreeMap<String, ArtifactRow>,
    groups: BTreeMap<String, GroupRow>,
}

impl ArtifactCatalog {
    /// Combine tag partitions into one view.
    pub fn merge(partitions: impl IntoIterator<Item = Self>) -> Self {
        let mut merged = Self::default();
        for partition in partitions {
            merged.artifacts.extend(partition.artifacts);
            merged.groups.extend(partition.groups);
        }
        merged
    }

    pub fn artifact(&self, coordinates: &ArtifactCoordinates) -> Option<&ArtifactRow> {
        self.artifacts.get(&coordinates.to_string())
    }

    pub fn group(&self, group_id: &str) -> Option<&GroupRow> {
        self.groups.get(group_id)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactRow> {
        self.artifacts.values()
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupRow> {
        self.groups.values()
    }

    fn apply_details(&mut self, event: &StoredEvent, domain: DetailsEvent) {
        let Ok(coordinates) = event.entity_key.as_str().parse::<ArtifactCoordinates>() else {
            tracing::warn!(entity_key = %event.entity_key, "details event with malformed key skipped");
            return;
        };
        let row = self
            .artifacts
            .entry(coordinates.to_string())
            .or_insert_with(|| ArtifactRow {
                group_id: coordinates.group_id.clone(),
                artifact_id: coordinates.artifact_id.clone(),
                ..ArtifactRow::default()
            });
        match domain {
            DetailsEvent::ArtifactRegistered { display_name, .. } => row.display_name = display_name,
            DetailsEvent::DisplayNameUpdated { display_name } => row.display_name = display_name,
            DetailsEvent::WebsiteUpdated { website } => row.website = website,
            DetailsEvent::IssuesUpdated { issues } => row.issues = issues,
            DetailsEvent::GitRepositoryUpdated { git_repository } => {
                row.git_repository = git_repository;
            }
        }
    }

    fn apply_group(&mut self, event: &StoredEvent, domain: GroupEvent) {
        let group_id = event.entity_key.as_str();
        let row = self
            .groups
            .entry(group_id.to_owned())
            .or_insert_with(|| GroupRow {
                group_id: group_id.to_owned(),
                ..GroupRow::default()
            });
        match domain {
            GroupEvent::GroupRegistered { group } => {
                row.name = group.name;
                row.website = group.website;
            }
            GroupEvent::ArtifactAdded { artifact_id } => {
                if row.absorbed.insert(event.event_id) {
                    row.artifacts.push(artifact_id);
                }
            }
        }
    }
}

impl Projection for ArtifactCatalog {
    const NAME: &'static str = "artifact-catalog";

    fn apply(&mut self, event: &StoredEvent) {
        // decode_domain_event returns None for every other aggregate type.
        if let Some(domain) = decode_domain_event::<ArtifactDetails>(event) {
            self.apply_details(event, domain);
        } else if let Some(domain) = decode_domain_event::<GroupAggregate>(event) {
            self.apply_group(event, domain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregate;
    use crate::artifacts::model::Group;
    use crate::command::CommandContext;
    use crate::event::{EntityKey, encode_domain_event};

    fn stored<A: Aggregate>(key: &str, event: &A::DomainEvent, position: u64) -> StoredEvent {
        let key = EntityKey::new(key);
        let new = encode_domain_event::<A>(event, &CommandContext::default(), &key)
            .expect("encode should succeed");
        StoredEvent {
            event_id: new.event_id,
            aggregate_type: A::AGGREGATE_TYPE.into(),
            entity_key: key,
            sequence: position + 1,
            global_position: position,
            tag: 0,
            event_type: new.event_type,
            payload: new.payload,
            metadata: new.metadata,
            recorded_at: 0,
        }
    }

    #[test]
    fn details_events_upsert_artifact_row() {
        let coords: ArtifactCoordinates = "org.spongepowered:example".parse().expect("coords");
        let mut catalog = ArtifactCatalog::default();
        catalog.apply(&stored::<ArtifactDetails>(
            "org.spongepowered:example",
            &DetailsEvent::ArtifactRegistered {
                coordinates: coords.clone(),
                display_name: "Example".into(),
            },
            0,
        ));
        let website = stored::<ArtifactDetails>(
            "org.spongepowered:example",
            &DetailsEvent::WebsiteUpdated {
                website: "https://spongepowered.org/".into(),
            },
            1,
        );
        catalog.apply(&website);
        catalog.apply(&website);

        let row = catalog.artifact(&coords).expect("row should exist");
        assert_eq!(row.display_name, "Example");
        assert_eq!(row.website, "https://spongepowered.org/");
        assert_eq!(row.group_id, "org.spongepowered");
    }

    #[test]
    fn artifact_appends_dedupe_by_event_id() {
        let mut catalog = ArtifactCatalog::default();
        catalog.apply(&stored::<GroupAggregate>(
            "org.spongepowered",
            &GroupEvent::GroupRegistered {
                group: Group::new("org.spongepowered", "SpongePowered", "https://spongepowered.org/"),
            },
            0,
        ));
        let added = stored::<GroupAggregate>(
            "org.spongepowered",
            &GroupEvent::ArtifactAdded {
                artifact_id: "example".into(),
            },
            1,
        );
        catalog.apply(&added);
        catalog.apply(&added);

        let group = catalog.group("org.spongepowered").expect("group row");
        assert_eq!(group.name, "SpongePowered");
        assert_eq!(group.artifacts, vec!["example".to_string()]);
    }

    #[test]
    fn foreign_aggregates_are_ignored() {
        let mut catalog = ArtifactCatalog::default();
        let mut event = stored::<GroupAggregate>(
            "global",
            &GroupEvent::ArtifactAdded {
                artifact_id: "x".into(),
            },
            0,
        );
        event.aggregate_type = "global".into();
        catalog.apply(&event);
        assert_eq!(catalog, ArtifactCatalog::default());
    }
}
