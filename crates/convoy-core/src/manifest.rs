//! Parsed pipeline manifest.
//!
//! The manifest text lives with the build; this is the structured form the
//! control core works with once the text has been parsed.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::trigger::ManifestTrigger;

pub const DEFAULT_TRACK: &str = "stable";
pub const DEFAULT_OS: &str = "linux";

/// A parsed pipeline manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub builder: BuilderSettings,
    pub version: VersionTemplate,
    pub labels: BTreeMap<String, String>,
    pub stages: Vec<ManifestStage>,
    pub release_targets: Vec<ReleaseTarget>,
    pub triggers: Vec<ManifestTrigger>,
}

impl Manifest {
    /// Stages run by a job: the build stages, or a release target's stages.
    pub fn stages_for(&self, release_name: Option<&str>) -> &[ManifestStage] {
        match release_name {
            Some(name) => self
                .release_targets
                .iter()
                .find(|t| t.name == name)
                .map(|t| t.stages.as_slice())
                .unwrap_or(&[]),
            None => &self.stages,
        }
    }
}

/// Executor image variant and platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderSettings {
    pub track: String,
    pub os: String,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            track: DEFAULT_TRACK.to_string(),
            os: DEFAULT_OS.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStage {
    pub name: String,
    pub image: String,
    /// Credential names the stage asks for explicitly.
    #[serde(default)]
    pub credentials: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseTarget {
    pub name: String,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub stages: Vec<ManifestStage>,
    #[serde(default)]
    pub triggers: Vec<ManifestTrigger>,
}

const AUTO_PLACEHOLDER: &str = "{{auto}}";
const BRANCH_PLACEHOLDER: &str = "{{branch}}";
const REVISION_PLACEHOLDER: &str = "{{revision}}";

static LABEL_INVALID_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9-]+").unwrap());

/// Semantic version template declared by the manifest.
///
/// `patch` and `label` may contain `{{auto}}`, `{{branch}}` and
/// `{{revision}}`. The label is only appended on branches that are not
/// release branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionTemplate {
    pub major: u64,
    pub minor: u64,
    pub patch: String,
    pub label: String,
    pub release_branches: Vec<String>,
}

impl Default for VersionTemplate {
    fn default() -> Self {
        Self {
            major: 0,
            minor: 0,
            patch: AUTO_PLACEHOLDER.to_string(),
            label: BRANCH_PLACEHOLDER.to_string(),
            release_branches: vec!["main".to_string(), "master".to_string()],
        }
    }
}

impl VersionTemplate {
    /// Render the version for an auto-increment value on a branch/revision.
    pub fn render(&self, auto_increment: i64, branch: &str, revision: &str) -> ResolvedVersion {
        let substitute = |template: &str| {
            template
                .replace(AUTO_PLACEHOLDER, &auto_increment.to_string())
                .replace(BRANCH_PLACEHOLDER, branch)
                .replace(REVISION_PLACEHOLDER, revision)
        };

        let patch = substitute(&self.patch);
        let label = if self.release_branches.iter().any(|b| b == branch) || self.label.is_empty() {
            None
        } else {
            let raw = substitute(&self.label);
            let sanitized = LABEL_INVALID_CHARS.replace_all(&raw, "-");
            let sanitized = sanitized.trim_matches('-').to_string();
            (!sanitized.is_empty()).then_some(sanitized)
        };

        let mut version = format!("{}.{}.{}", self.major, self.minor, patch);
        if let Some(label) = &label {
            version.push('-');
            version.push_str(label);
        }

        ResolvedVersion {
            version,
            major: self.major,
            minor: self.minor,
            patch,
            label,
            auto_increment,
        }
    }
}

/// A concrete version handed to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedVersion {
    pub version: String,
    pub major: u64,
    pub minor: u64,
    pub patch: String,
    pub label: Option<String>,
    pub auto_increment: i64,
}
