//! Version resolution from the per-pipeline counter.

use convoy_core::PipelineIdentity;
use convoy_core::manifest::{ResolvedVersion, VersionTemplate};
use convoy_db::BuildRepo;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::warn;

use crate::ServiceResult;

/// Trailing numeric component of a version, ignoring a `-label` suffix.
static TRAILING_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)(?:-[0-9A-Za-z.\-]+)?$").unwrap());

static MAJOR_MINOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)\.(\d+)\.").unwrap());

/// Extract the auto-increment embedded in an explicit version string.
pub fn extract_auto_increment(version: &str) -> Option<i64> {
    TRAILING_NUMBER
        .captures(version)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[derive(Clone)]
pub struct VersionResolver {
    repo: Arc<dyn BuildRepo>,
}

impl VersionResolver {
    pub fn new(repo: Arc<dyn BuildRepo>) -> Self {
        Self { repo }
    }

    /// Next version for a pipeline, or the given explicit version with its
    /// embedded counter. Falls back to the counter when the explicit version
    /// carries no number.
    pub async fn resolve(
        &self,
        identity: &PipelineIdentity,
        template: &VersionTemplate,
        branch: &str,
        revision: &str,
        explicit: Option<&str>,
    ) -> ServiceResult<ResolvedVersion> {
        let Some(explicit) = explicit.filter(|v| !v.is_empty()) else {
            let auto_increment = self.repo.get_auto_increment(identity).await?;
            return Ok(template.render(auto_increment, branch, revision));
        };

        let auto_increment = match extract_auto_increment(explicit) {
            Some(n) => n,
            None => {
                warn!(pipeline = %identity, version = %explicit, "No counter in version, using next counter value");
                self.repo.get_auto_increment(identity).await?
            }
        };

        let (major, minor) = MAJOR_MINOR
            .captures(explicit)
            .and_then(|c| Some((c[1].parse().ok()?, c[2].parse().ok()?)))
            .unwrap_or((template.major, template.minor));
        let (patch, label) = match explicit.splitn(3, '.').nth(2) {
            Some(rest) => match rest.split_once('-') {
                Some((patch, label)) => (patch.to_string(), Some(label.to_string())),
                None => (rest.to_string(), None),
            },
            None => (auto_increment.to_string(), None),
        };

        Ok(ResolvedVersion {
            version: explicit.to_string(),
            major,
            minor,
            patch,
            label,
            auto_increment,
        })
    }
}
