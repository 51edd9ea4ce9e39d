//! Input checks performed outside the runtime before a command is issued.
//!
//! Git remotes and version listings come from external systems, so they sit
//! behind async traits. Each has an in-memory implementation for tests and
//! single-process hosts.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::{Host, Url};

use super::model::ArtifactCoordinates;

/// Error returned by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// The external system could not be reached.
    #[error("collaborator unreachable: {0}")]
    Unreachable(String),

    /// The external system answered and rejected the input.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// An `http(s)` URL that passed validation.
///
/// Stored in the normalized form produced by [`url::Url`]. Deserializing
/// runs the same checks as [`ValidatedUrl::parse`], so a forwarded command
/// cannot carry an unchecked URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ValidatedUrl(String);

fn rejected(raw: &str, reason: impl fmt::Display) -> CollaboratorError {
    CollaboratorError::Rejected(format!("invalid URL {raw:?}: {reason}"))
}

impl ValidatedUrl {
    /// Accept `raw` if it is an absolute `http` or `https` URL with a
    /// well-formed host.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError::Rejected`] otherwise.
    pub fn parse(raw: &str) -> Result<Self, CollaboratorError> {
        let raw = raw.trim();
        // `Url::parse` silently drops tabs and newlines.
        if raw.chars().any(char::is_whitespace) {
            return Err(rejected(raw, "contains whitespace"));
        }
        let url = Url::parse(raw).map_err(|e| rejected(raw, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(rejected(raw, "scheme must be http or https"));
        }
        match url.host() {
            Some(Host::Ipv4(_) | Host::Ipv6(_)) => {}
            Some(Host::Domain(domain))
                if domain
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_')) => {}
            _ => return Err(rejected(raw, "missing or malformed host")),
        }
        Ok(Self(url.into()))
    }

    /// The URL.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ValidatedUrl {
    type Error = CollaboratorError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<ValidatedUrl> for String {
    fn from(url: ValidatedUrl) -> Self {
        url.0
    }
}

impl fmt::Display for ValidatedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A git remote confirmed to exist, with the refs it advertised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRemote {
    /// Remote URL.
    pub url: String,
    /// Advertised refs.
    pub refs: Vec<String>,
}

/// Checks that a git remote is reachable.
#[async_trait]
pub trait GitRemoteValidator: Send + Sync {
    /// Resolve the refs of `remote`.
    async fn validate(&self, remote: &str) -> Result<GitRemote, CollaboratorError>;
}

/// Lists published versions of an artifact.
#[async_trait]
pub trait VersionResolver: Send + Sync {
    /// Versions of `coordinates`, as listed by the package repository.
    async fn versions(&self, coordinates: &ArtifactCoordinates) -> Result<Vec<String>, CollaboratorError>;
}

/// Git remotes known up front. Clones share the table.
#[derive(Debug, Clone, Default)]
pub struct StaticGitRemotes {
    remotes: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl StaticGitRemotes {
    /// Create an empty table; every remote is rejected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `url` valid with `refs`.
    pub fn insert(&self, url: impl Into<String>, refs: Vec<String>) {
        self.remotes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), refs);
    }
}

#[async_trait]
impl GitRemoteValidator for StaticGitRemotes {
    async fn validate(&self, remote: &str) -> Result<GitRemote, CollaboratorError> {
        let remotes = self.remotes.read().unwrap_or_else(PoisonError::into_inner);
        let refs = remotes
            .get(remote)
            .ok_or_else(|| CollaboratorError::Rejected(format!("unknown git remote {remote}")))?;
        Ok(GitRemote {
            url: remote.to_owned(),
            refs: refs.clone(),
        })
    }
}

/// Version listings known up front. Clones share the table.
#[derive(Debug, Clone, Default)]
pub struct StaticVersions {
    versions: Arc<RwLock<HashMap<ArtifactCoordinates, Vec<String>>>>,
}

impl StaticVersions {
    /// Create an empty table; every artifact lists no versions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listing for `coordinates`.
    pub fn insert(&self, coordinates: ArtifactCoordinates, versions: Vec<String>) {
        self.versions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(coordinates, versions);
    }
}

#[async_trait]
impl VersionResolver for StaticVersions {
    async fn versions(&self, coordinates: &ArtifactCoordinates) -> Result<Vec<String>, CollaboratorError> {
        Ok(self
            .versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(coordinates)
            .cloned()
            .unwrap_or_default())
    }
}
