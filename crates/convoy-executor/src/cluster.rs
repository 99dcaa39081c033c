//! The slice of the cluster API the job orchestrator needs.

use async_trait::async_trait;
use futures::channel::mpsc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use std::time::Duration;

use crate::ExecResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Active,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub phase: PodPhase,
}

/// Cluster operations on executor jobs and their companion objects.
///
/// Deletes and gets report a missing object as a not-found error
/// (see [`crate::ExecutorError::is_not_found`]).
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_config_map(&self, config_map: ConfigMap) -> ExecResult<()>;
    async fn create_secret(&self, secret: Secret) -> ExecResult<()>;
    async fn create_job(&self, job: Job) -> ExecResult<()>;

    async fn get_job_phase(&self, name: &str) -> ExecResult<JobPhase>;

    async fn delete_job(&self, name: &str) -> ExecResult<()>;
    async fn delete_config_map(&self, name: &str) -> ExecResult<()>;
    async fn delete_secret(&self, name: &str) -> ExecResult<()>;

    /// Block until the job succeeds, is deleted, or the watch closes.
    /// Errors with a timeout once `timeout` elapses.
    async fn watch_job_until_succeeded(&self, name: &str, timeout: Duration) -> ExecResult<()>;

    /// Pods carrying the `job-name` label of `job_name`.
    async fn list_job_pods(&self, job_name: &str) -> ExecResult<Vec<PodInfo>>;

    /// Block until the pod leaves `Pending`, returning its new phase.
    async fn watch_pod_until_started(&self, pod_name: &str, timeout: Duration) -> ExecResult<PodPhase>;

    /// Follow the pod's output, sending each line into `lines` until the
    /// stream ends.
    async fn follow_pod_logs(&self, pod_name: &str, lines: mpsc::Sender<String>) -> ExecResult<()>;
}
