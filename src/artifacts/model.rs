//! Artifact identity types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::event::EntityKey;

/// Error returned when artifact coordinates are malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatesError {
    /// The input is not of the form `group:artifact`.
    #[error("expected `group:artifact`, got {0:?}")]
    Malformed(String),

    /// One part is empty or contains whitespace or `:`.
    #[error("invalid {part} {value:?}")]
    InvalidPart {
        /// `"group id"` or `"artifact id"`.
        part: &'static str,
        /// The offending value.
        value: String,
    },
}

/// Maven group and artifact id of one artifact.
///
/// # Examples
///
/// ```
/// use artifact_es::artifacts::ArtifactCoordinates;
///
/// let coords: ArtifactCoordinates = "org.spongepowered:spongevanilla".parse().unwrap();
/// assert_eq!(coords.group_id, "org.spongepowered");
/// assert_eq!(coords.to_string(), "org.spongepowered:spongevanilla");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinates")]
pub struct ArtifactCoordinates {
    /// Maven group id.
    pub group_id: String,
    /// Maven artifact id.
    pub artifact_id: String,
}

/// Unchecked wire form of [`ArtifactCoordinates`].
#[derive(Deserialize)]
struct RawCoordinates {
    group_id: String,
    artifact_id: String,
}

impl TryFrom<RawCoordinates> for ArtifactCoordinates {
    type Error = CoordinatesError;

    fn try_from(raw: RawCoordinates) -> Result<Self, Self::Error> {
        Self::new(raw.group_id, raw.artifact_id)
    }
}

fn check_part(part: &'static str, value: &str) -> Result<(), CoordinatesError> {
    if value.is_empty() || value.contains(':') || value.chars().any(char::is_whitespace) {
        return Err(CoordinatesError::InvalidPart {
            part,
            value: value.to_owned(),
        });
    }
    Ok(())
}

impl ArtifactCoordinates {
    /// Build coordinates from their parts.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatesError::InvalidPart`] if either part is empty or
    /// contains whitespace or `:`.
    pub fn new(
        group_id: impl Into<String>,
        artifact_id: impl Into<String>,
    ) -> Result<Self, CoordinatesError> {
        let (group_id, artifact_id) = (group_id.into(), artifact_id.into());
        check_part("group id", &group_id)?;
        check_part("artifact id", &artifact_id)?;
        Ok(Self {
            group_id,
            artifact_id,
        })
    }

    /// Entity key of this artifact's details aggregate.
    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.to_string())
    }
}

impl FromStr for ArtifactCoordinates {
    type Err = CoordinatesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group_id, artifact_id) = s
            .split_once(':')
            .ok_or_else(|| CoordinatesError::Malformed(s.to_owned()))?;
        Self::new(group_id, artifact_id)
    }
}

impl fmt::Display for ArtifactCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_id, self.artifact_id)
    }
}

/// A Maven group with its display metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Maven group id; also the group aggregate's entity key.
    pub group_id: String,
    /// Display name.
    pub name: String,
    /// Homepage.
    pub website: String,
}

impl Group {
    /// Create a group record.
    pub fn new(
        group_id: impl Into<String>,
        name: impl Into<String>,
        website: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            name: name.into(),
            website: website.into(),
        }
    }

    /// Check the group id by the same rule as coordinate parts.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatesError::InvalidPart`] if the id is empty or
    /// contains whitespace or `:`.
    pub fn validate(&self) -> Result<(), CoordinatesError> {
        check_part("group id", &self.group_id)
    }

    /// Entity key of this group's aggregate.
    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.group_id.clone())
    }
}
