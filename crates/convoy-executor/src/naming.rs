//! Deterministic executor job names.

use convoy_core::PipelineIdentity;
use convoy_core::executor::JobType;
use regex::Regex;
use std::sync::LazyLock;

/// Kubernetes label values and job names cap out at 63 characters.
pub const MAX_JOB_NAME_LEN: usize = 63;

static INVALID_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9]+").unwrap());

/// `{type}-{owner-name}-{id}`, lower-cased. Only the repository segment is
/// truncated to keep the name within [`MAX_JOB_NAME_LEN`].
pub fn job_name(job_type: JobType, identity: &PipelineIdentity, id: i64) -> String {
    let prefix = job_type.as_str();
    let suffix = id.to_string();

    let repo = INVALID_NAME_CHARS
        .replace_all(&identity.repo_path(), "-")
        .to_lowercase();

    let budget = MAX_JOB_NAME_LEN.saturating_sub(prefix.len() + suffix.len() + 2);
    // Sanitised names are ASCII, so byte truncation is safe.
    let repo = repo[..repo.len().min(budget)].trim_matches('-');

    if repo.is_empty() {
        format!("{prefix}-{suffix}")
    } else {
        format!("{prefix}-{repo}-{suffix}")
    }
}
