//! Executor job types and the job orchestrator interface.
//!
//! Executor jobs run one build's or release's stages on the cluster. The
//! control core only creates, tracks and retires them.

use async_trait::async_trait;
use futures::channel::mpsc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::build::{JobResources, LogLine};
use crate::manifest::{Manifest, ResolvedVersion};
use crate::pipeline::PipelineIdentity;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Build,
    Release,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Build => "build",
            JobType::Release => "release",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the orchestrator needs to launch one executor job.
#[derive(Debug, Clone)]
pub struct BuildJobParams {
    pub job_type: JobType,
    pub identity: PipelineIdentity,
    pub branch: String,
    pub revision: String,
    /// Clone URL with credentials embedded.
    pub git_url: String,
    /// Short-lived source-control token, also handed to stages as a credential.
    pub git_token: Option<String>,
    /// Credential environment variables for the executor container.
    pub env_vars: BTreeMap<String, String>,
    pub track: String,
    pub version: ResolvedVersion,
    pub manifest: Manifest,
    pub build_id: i64,
    pub release_id: Option<i64>,
    pub release_name: Option<String>,
    pub release_action: Option<String>,
    pub triggered_by: Option<String>,
    pub resources: JobResources,
}

impl BuildJobParams {
    /// The id that keys the job name: the release id for release jobs.
    pub fn job_id(&self) -> i64 {
        match self.job_type {
            JobType::Build => self.build_id,
            JobType::Release => self.release_id.unwrap_or(self.build_id),
        }
    }
}

/// A structured log record forwarded from a running executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TailLogLine {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_line: Option<LogLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Creates, tracks and retires executor jobs.
#[async_trait]
pub trait CiBuilderClient: Send + Sync {
    /// Launch the executor job for a build or release.
    async fn create_ci_builder_job(&self, params: BuildJobParams) -> Result<String>;

    /// Wait (bounded) for the job to succeed, then delete it and its config/secret.
    async fn remove_ci_builder_job(&self, job_name: &str) -> Result<()>;

    /// Delete the job immediately, then its config/secret.
    async fn cancel_ci_builder_job(&self, job_name: &str) -> Result<()>;

    /// Forward the job's structured log lines into `sink`; the sink is
    /// dropped once every pod has been drained.
    async fn tail_ci_builder_job_logs(
        &self,
        job_name: &str,
        sink: mpsc::Sender<TailLogLine>,
    ) -> Result<()>;

    /// Deterministic job name for a build or release.
    fn get_job_name(&self, job_type: JobType, identity: &PipelineIdentity, id: i64) -> String;
}
