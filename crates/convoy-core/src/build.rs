//! Builds, releases and their shared status space.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::manifest::ReleaseTarget;
use crate::pipeline::PipelineIdentity;
use crate::trigger::ManifestTrigger;

/// Sentinel recorded on builds and releases created by a trigger.
pub const TRIGGERED_BY_TRIGGER: &str = "trigger";

/// Status shared by builds and releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Persisted, executor job not started yet.
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Cancellation requested, executor job still being torn down.
    Canceling,
    Canceled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Canceling => "canceling",
            Status::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed | Status::Canceled)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "running" => Ok(Status::Running),
            "succeeded" => Ok(Status::Succeeded),
            "failed" => Ok(Status::Failed),
            "canceling" => Ok(Status::Canceling),
            "canceled" => Ok(Status::Canceled),
            other => Err(crate::Error::InvalidInput(format!("unknown status: {other}"))),
        }
    }
}

/// CPU (cores) and memory (bytes) request/limit pair for an executor job.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResources {
    pub cpu_request: f64,
    pub cpu_limit: f64,
    pub memory_request: f64,
    pub memory_limit: f64,
}

/// Peak usage measured while a job ran, reported when it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUtilization {
    pub cpu_max_usage: f64,
    pub memory_max_usage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub message: String,
    pub author: String,
}

/// A single build of a pipeline at a branch and revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    /// Assigned by persistence; zero until inserted.
    pub id: i64,
    pub identity: PipelineIdentity,
    pub branch: String,
    pub revision: String,
    /// `None` asks the version resolver to allocate the next version.
    pub version: Option<String>,
    pub status: Status,
    pub labels: BTreeMap<String, String>,
    pub release_targets: Vec<ReleaseTarget>,
    pub manifest: String,
    pub triggers: Vec<ManifestTrigger>,
    pub commits: Vec<Commit>,
    pub triggered_by: Option<String>,
    pub inserted_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn new(identity: PipelineIdentity, branch: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            id: 0,
            identity,
            branch: branch.into(),
            revision: revision.into(),
            version: None,
            status: Status::Pending,
            labels: BTreeMap::new(),
            release_targets: Vec::new(),
            manifest: String::new(),
            triggers: Vec::new(),
            commits: Vec::new(),
            triggered_by: None,
            inserted_at: None,
        }
    }
}

/// A release of a succeeded build to one target with one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    /// Assigned by persistence; zero until inserted.
    pub id: i64,
    pub identity: PipelineIdentity,
    /// Release target name.
    pub name: String,
    pub action: Option<String>,
    pub version: String,
    pub status: Status,
    pub triggered_by: Option<String>,
    pub inserted_at: Option<DateTime<Utc>>,
}

/// One line of executor output as stored in a build log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub line_number: u64,
    pub timestamp: DateTime<Utc>,
    pub stream_type: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStep {
    pub step: String,
    pub image: Option<String>,
    pub status: Status,
    pub exit_code: i64,
    pub log_lines: Vec<LogLine>,
}

/// Persisted log of a build, one entry per executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLog {
    pub id: i64,
    pub build_id: i64,
    pub identity: PipelineIdentity,
    pub branch: String,
    pub revision: String,
    pub steps: Vec<LogStep>,
    pub inserted_at: Option<DateTime<Utc>>,
}
