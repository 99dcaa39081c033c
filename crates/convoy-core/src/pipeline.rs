//! Pipeline identity and latest-known pipeline state.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::build::Status;
use crate::manifest::ReleaseTarget;
use crate::trigger::ManifestTrigger;

/// The (source, owner, name) triple grouping builds and releases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{source}/{owner}/{name}")]
pub struct PipelineIdentity {
    /// Git host, e.g. `github.com`.
    pub source: String,
    pub owner: String,
    pub name: String,
}

impl PipelineIdentity {
    pub fn new(source: impl Into<String>, owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse `source/owner/name`.
    pub fn parse(full_name: &str) -> Option<Self> {
        let mut parts = full_name.splitn(3, '/');
        let source = parts.next().filter(|s| !s.is_empty())?;
        let owner = parts.next().filter(|s| !s.is_empty())?;
        let name = parts.next().filter(|s| !s.is_empty())?;
        Some(Self::new(source, owner, name))
    }

    pub fn full_name(&self) -> String {
        self.to_string()
    }

    /// `owner/name`, the part of the identity that ends up in job names.
    pub fn repo_path(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Latest known state of a pipeline, as returned by the trigger queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub identity: PipelineIdentity,
    /// Id of the most recent build.
    pub build_id: i64,
    pub build_version: String,
    pub build_status: Status,
    pub branch: String,
    pub revision: String,
    pub manifest: String,
    pub triggers: Vec<ManifestTrigger>,
    pub release_targets: Vec<ReleaseTarget>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_name() {
        let identity = PipelineIdentity::parse("github.com/acme/app").unwrap();
        assert_eq!(identity.source, "github.com");
        assert_eq!(identity.owner, "acme");
        assert_eq!(identity.name, "app");
        assert_eq!(identity.full_name(), "github.com/acme/app");
        assert_eq!(identity.repo_path(), "acme/app");
    }

    #[test]
    fn test_parse_rejects_partial_names() {
        assert!(PipelineIdentity::parse("github.com/acme").is_none());
        assert!(PipelineIdentity::parse("github.com//app").is_none());
        assert!(PipelineIdentity::parse("").is_none());
    }
}
