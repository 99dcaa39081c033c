//! Logging interceptor for the persistence and job orchestrator interfaces.
//!
//! [`Instrumented`] wraps any [`BuildRepo`] or [`CiBuilderClient`] and logs
//! each call's operation name, duration and outcome.

use async_trait::async_trait;
use convoy_core::executor::{BuildJobParams, CiBuilderClient, JobType, TailLogLine};
use convoy_core::trigger::{GitEvent, PubSubEvent, TriggerEvent};
use convoy_core::{
    Build, BuildLog, JobResources, Pipeline, PipelineIdentity, Release, ResourceUtilization, Status,
};
use convoy_db::{BuildRepo, DbResult};
use futures::channel::mpsc;
use std::fmt::Display;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, warn};

pub struct Instrumented<T> {
    inner: T,
    component: &'static str,
}

impl<T> Instrumented<T> {
    pub fn new(inner: T, component: &'static str) -> Self {
        Self { inner, component }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    async fn observe<R, E, F>(&self, operation: &'static str, call: F) -> Result<R, E>
    where
        E: Display,
        F: Future<Output = Result<R, E>>,
    {
        let started = Instant::now();
        let result = call.await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(component = self.component, operation, elapsed_ms, "Call succeeded"),
            Err(e) => warn!(component = self.component, operation, elapsed_ms, error = %e, "Call failed"),
        }
        result
    }
}

#[async_trait]
impl<T: BuildRepo> BuildRepo for Instrumented<T> {
    async fn get_auto_increment(&self, identity: &PipelineIdentity) -> DbResult<i64> {
        self.observe("get_auto_increment", self.inner.get_auto_increment(identity))
            .await
    }

    async fn insert_build(&self, build: &Build, resources: &JobResources) -> DbResult<Build> {
        self.observe("insert_build", self.inner.insert_build(build, resources))
            .await
    }

    async fn insert_release(&self, release: &Release, resources: &JobResources) -> DbResult<Release> {
        self.observe("insert_release", self.inner.insert_release(release, resources))
            .await
    }

    async fn update_build_status(&self, identity: &PipelineIdentity, id: i64, status: Status) -> DbResult<()> {
        self.observe(
            "update_build_status",
            self.inner.update_build_status(identity, id, status),
        )
        .await
    }

    async fn update_release_status(&self, identity: &PipelineIdentity, id: i64, status: Status) -> DbResult<()> {
        self.observe(
            "update_release_status",
            self.inner.update_release_status(identity, id, status),
        )
        .await
    }

    async fn update_build_resource_utilization(
        &self,
        identity: &PipelineIdentity,
        id: i64,
        utilization: &ResourceUtilization,
    ) -> DbResult<()> {
        self.observe(
            "update_build_resource_utilization",
            self.inner
                .update_build_resource_utilization(identity, id, utilization),
        )
        .await
    }

    async fn update_release_resource_utilization(
        &self,
        identity: &PipelineIdentity,
        id: i64,
        utilization: &ResourceUtilization,
    ) -> DbResult<()> {
        self.observe(
            "update_release_resource_utilization",
            self.inner
                .update_release_resource_utilization(identity, id, utilization),
        )
        .await
    }

    async fn get_pipeline(&self, identity: &PipelineIdentity) -> DbResult<Pipeline> {
        self.observe("get_pipeline", self.inner.get_pipeline(identity))
            .await
    }

    async fn get_pipeline_triggers(&self, build: &Build, event: TriggerEvent) -> DbResult<Vec<Pipeline>> {
        self.observe(
            "get_pipeline_triggers",
            self.inner.get_pipeline_triggers(build, event),
        )
        .await
    }

    async fn get_release_triggers(&self, release: &Release, event: TriggerEvent) -> DbResult<Vec<Pipeline>> {
        self.observe(
            "get_release_triggers",
            self.inner.get_release_triggers(release, event),
        )
        .await
    }

    async fn get_cron_triggers(&self) -> DbResult<Vec<Pipeline>> {
        self.observe("get_cron_triggers", self.inner.get_cron_triggers())
            .await
    }

    async fn get_git_triggers(&self, event: &GitEvent) -> DbResult<Vec<Pipeline>> {
        self.observe("get_git_triggers", self.inner.get_git_triggers(event))
            .await
    }

    async fn get_pubsub_triggers(&self, event: &PubSubEvent) -> DbResult<Vec<Pipeline>> {
        self.observe("get_pubsub_triggers", self.inner.get_pubsub_triggers(event))
            .await
    }

    async fn get_last_pipeline_build_for_branch(
        &self,
        identity: &PipelineIdentity,
        branch: &str,
    ) -> DbResult<Option<Build>> {
        self.observe(
            "get_last_pipeline_build_for_branch",
            self.inner
                .get_last_pipeline_build_for_branch(identity, branch),
        )
        .await
    }

    async fn get_build_by_id(&self, identity: &PipelineIdentity, id: i64) -> DbResult<Build> {
        self.observe("get_build_by_id", self.inner.get_build_by_id(identity, id))
            .await
    }

    async fn get_build_by_version(&self, identity: &PipelineIdentity, version: &str) -> DbResult<Option<Build>> {
        self.observe(
            "get_build_by_version",
            self.inner.get_build_by_version(identity, version),
        )
        .await
    }

    async fn get_release_by_id(&self, identity: &PipelineIdentity, id: i64) -> DbResult<Release> {
        self.observe("get_release_by_id", self.inner.get_release_by_id(identity, id))
            .await
    }

    async fn get_pipeline_max_resource_utilization(
        &self,
        identity: &PipelineIdentity,
        lookback: i64,
    ) -> DbResult<Option<ResourceUtilization>> {
        self.observe(
            "get_pipeline_max_resource_utilization",
            self.inner
                .get_pipeline_max_resource_utilization(identity, lookback),
        )
        .await
    }

    async fn insert_build_log(&self, log: &BuildLog) -> DbResult<BuildLog> {
        self.observe("insert_build_log", self.inner.insert_build_log(log))
            .await
    }
}

#[async_trait]
impl<T: CiBuilderClient> CiBuilderClient for Instrumented<T> {
    async fn create_ci_builder_job(&self, params: BuildJobParams) -> convoy_core::Result<String> {
        self.observe("create_ci_builder_job", self.inner.create_ci_builder_job(params))
            .await
    }

    async fn remove_ci_builder_job(&self, job_name: &str) -> convoy_core::Result<()> {
        self.observe("remove_ci_builder_job", self.inner.remove_ci_builder_job(job_name))
            .await
    }

    async fn cancel_ci_builder_job(&self, job_name: &str) -> convoy_core::Result<()> {
        self.observe("cancel_ci_builder_job", self.inner.cancel_ci_builder_job(job_name))
            .await
    }

    async fn tail_ci_builder_job_logs(
        &self,
        job_name: &str,
        sink: mpsc::Sender<TailLogLine>,
    ) -> convoy_core::Result<()> {
        self.observe(
            "tail_ci_builder_job_logs",
            self.inner.tail_ci_builder_job_logs(job_name, sink),
        )
        .await
    }

    fn get_job_name(&self, job_type: JobType, identity: &PipelineIdentity, id: i64) -> String {
        self.inner.get_job_name(job_type, identity, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockCiBuilder, MockRepo};

    #[tokio::test]
    async fn test_passes_results_through() {
        let repo = Instrumented::new(MockRepo::default(), "db");
        let identity = PipelineIdentity::new("github.com", "acme", "app");

        assert_eq!(repo.get_auto_increment(&identity).await.unwrap(), 1);
        assert_eq!(repo.get_auto_increment(&identity).await.unwrap(), 2);
        assert!(repo.get_build_by_id(&identity, 99).await.is_err());
    }

    #[tokio::test]
    async fn test_wraps_job_orchestrator() {
        let client = Instrumented::new(MockCiBuilder::default(), "executor");
        client.cancel_ci_builder_job("build-acme-app-1").await.unwrap();
        assert_eq!(client.inner().canceled(), vec!["build-acme-app-1".to_string()]);
        assert_eq!(
            client.get_job_name(JobType::Build, &PipelineIdentity::new("github.com", "acme", "app"), 1),
            "build-acme-app-1"
        );
    }
}
