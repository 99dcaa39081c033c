//! Build and release lifecycle.
//!
//! [`CiBuildService`] persists builds and releases, launches their executor
//! jobs and fires the triggers that depend on them. Work that must not hold
//! up the caller (fire-and-forget job creation, trigger dispatch) goes
//! through the [`WorkQueue`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_config::{ConfigHandle, parse_manifest};
use convoy_core::build::{LogLine, TRIGGERED_BY_TRIGGER};
use convoy_core::executor::{BuildJobParams, CiBuilderClient, JobType};
use convoy_core::git::GitProviderResolver;
use convoy_core::manifest::Manifest;
use convoy_core::trigger::{GitEvent, PubSubEvent, TriggerEvent, TriggerFilter};
use convoy_core::{
    Build, BuildLog, JobResources, LogStep, PipelineIdentity, Release, ResourceUtilization, Status,
};
use convoy_db::BuildRepo;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::queue::WorkQueue;
use crate::resources::{UTILIZATION_LOOKBACK, size_resources};
use crate::version::VersionResolver;
use crate::{ServiceError, ServiceResult};

const LOG_INSERT_ATTEMPTS: u64 = 3;
const LOG_INSERT_BACKOFF: Duration = Duration::from_millis(100);

/// Step name of the synthetic log entry recorded for builds that never ran.
pub const VALIDATION_STEP: &str = "validate-manifest";

/// Lifecycle operations exposed to the transport and webhook handlers.
#[async_trait]
pub trait BuildService: Send + Sync {
    /// Persist a build and start its executor job, synchronously when
    /// `wait_for_start` is set. Builds with an invalid manifest or an
    /// unsupported source are persisted as failed and never run.
    async fn create_build(&self, build: Build, wait_for_start: bool) -> ServiceResult<Build>;

    /// Record a build's terminal status and fire its "finished" triggers.
    async fn finish_build(&self, identity: &PipelineIdentity, id: i64, status: Status) -> ServiceResult<()>;

    /// Persist a release of an already succeeded build and start its job.
    async fn create_release(&self, release: Release, wait_for_start: bool) -> ServiceResult<Release>;

    async fn finish_release(&self, identity: &PipelineIdentity, id: i64, status: Status) -> ServiceResult<()>;

    /// Advance a build towards canceled; returns the persisted status.
    async fn cancel_build(&self, identity: &PipelineIdentity, id: i64) -> ServiceResult<Status>;

    async fn cancel_release(&self, identity: &PipelineIdentity, id: i64) -> ServiceResult<Status>;

    async fn update_build_resource_utilization(
        &self,
        identity: &PipelineIdentity,
        id: i64,
        utilization: ResourceUtilization,
    ) -> ServiceResult<()>;

    async fn update_release_resource_utilization(
        &self,
        identity: &PipelineIdentity,
        id: i64,
        utilization: ResourceUtilization,
    ) -> ServiceResult<()>;

    async fn fire_pipeline_triggers(&self, build: &Build, event: TriggerEvent) -> ServiceResult<()>;
    async fn fire_release_triggers(&self, release: &Release, event: TriggerEvent) -> ServiceResult<()>;
    async fn fire_cron_triggers(&self, at: DateTime<Utc>) -> ServiceResult<()>;
    async fn fire_git_triggers(&self, event: &GitEvent) -> ServiceResult<()>;
    async fn fire_pubsub_triggers(&self, event: &PubSubEvent) -> ServiceResult<()>;
}

/// The build or release a job runs for.
#[derive(Debug, Clone)]
enum Subject {
    Build(Build),
    Release(Release),
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Build(b) => write!(f, "build-{}-{}", b.identity, b.id),
            Subject::Release(r) => write!(f, "release-{}-{}", r.identity, r.id),
        }
    }
}

#[derive(Clone)]
pub struct CiBuildService {
    pub(crate) repo: Arc<dyn BuildRepo>,
    pub(crate) ci_builder: Arc<dyn CiBuilderClient>,
    git: GitProviderResolver,
    config: ConfigHandle,
    pub(crate) queue: WorkQueue,
    versions: VersionResolver,
}

impl CiBuildService {
    pub fn new(
        repo: Arc<dyn BuildRepo>,
        ci_builder: Arc<dyn CiBuilderClient>,
        git: GitProviderResolver,
        config: ConfigHandle,
        queue: WorkQueue,
    ) -> Self {
        let versions = VersionResolver::new(repo.clone());
        Self {
            repo,
            ci_builder,
            git,
            config,
            queue,
            versions,
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    async fn job_resources(&self, identity: &PipelineIdentity) -> JobResources {
        let history = match self
            .repo
            .get_pipeline_max_resource_utilization(identity, UTILIZATION_LOOKBACK)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(pipeline = %identity, error = %e, "Failed to read resource history, using defaults");
                None
            }
        };
        size_resources(history, &self.config.snapshot().jobs)
    }

    async fn record_validation_failure(&self, build: &Build, message: &str) {
        let log = BuildLog {
            id: 0,
            build_id: build.id,
            identity: build.identity.clone(),
            branch: build.branch.clone(),
            revision: build.revision.clone(),
            steps: vec![LogStep {
                step: VALIDATION_STEP.to_string(),
                image: None,
                status: Status::Failed,
                exit_code: 1,
                log_lines: vec![LogLine {
                    line_number: 1,
                    timestamp: Utc::now(),
                    stream_type: "stderr".to_string(),
                    text: message.to_string(),
                }],
            }],
            inserted_at: None,
        };

        for attempt in 1..=LOG_INSERT_ATTEMPTS {
            match self.repo.insert_build_log(&log).await {
                Ok(_) => return,
                Err(e) if attempt < LOG_INSERT_ATTEMPTS => {
                    warn!(build_id = build.id, attempt, error = %e, "Failed to insert build log, retrying");
                    tokio::time::sleep(LOG_INSERT_BACKOFF * attempt as u32).await;
                }
                Err(e) => {
                    error!(build_id = build.id, error = %e, "Giving up inserting build log");
                }
            }
        }
    }

    async fn set_status(&self, job_type: JobType, identity: &PipelineIdentity, id: i64, status: Status) -> ServiceResult<()> {
        match job_type {
            JobType::Build => self.repo.update_build_status(identity, id, status).await?,
            JobType::Release => self.repo.update_release_status(identity, id, status).await?,
        }
        Ok(())
    }

    async fn mark_failed(&self, subject: &Subject) {
        let result = match subject {
            Subject::Build(b) => self.set_status(JobType::Build, &b.identity, b.id, Status::Failed).await,
            Subject::Release(r) => self.set_status(JobType::Release, &r.identity, r.id, Status::Failed).await,
        };
        if let Err(e) = result {
            error!(subject = %subject, error = %e, "Failed to mark as failed");
        }
    }

    async fn fire_started(&self, subject: Subject) {
        let result = match &subject {
            Subject::Build(b) => self.fire_pipeline_triggers(b, TriggerEvent::Started).await,
            Subject::Release(r) => self.fire_release_triggers(r, TriggerEvent::Started).await,
        };
        if let Err(e) = result {
            warn!(subject = %subject, error = %e, "Failed to fire started triggers");
        }
    }

    /// Create the executor job, then fire "started" triggers. Both happen on
    /// one queued unit of work unless the caller waits for the start.
    async fn launch(&self, params: BuildJobParams, subject: Subject, wait_for_start: bool) -> ServiceResult<()> {
        if wait_for_start {
            if let Err(e) = self.ci_builder.create_ci_builder_job(params).await {
                self.mark_failed(&subject).await;
                return Err(e.into());
            }
            let svc = self.clone();
            self.queue
                .submit_or_run(format!("started-{subject}"), async move { svc.fire_started(subject).await })
                .await;
            return Ok(());
        }

        let svc = self.clone();
        self.queue
            .submit_or_run(format!("launch-{subject}"), async move {
                if let Err(e) = svc.ci_builder.create_ci_builder_job(params).await {
                    error!(subject = %subject, error = %e, "Failed to create executor job");
                    svc.mark_failed(&subject).await;
                    return;
                }
                svc.fire_started(subject).await;
            })
            .await;
        Ok(())
    }

    async fn cancel(&self, job_type: JobType, identity: &PipelineIdentity, id: i64, current: Status) -> ServiceResult<Status> {
        let job = self.ci_builder.get_job_name(job_type, identity, id);
        match current {
            // No executor job exists yet.
            Status::Pending => {
                self.set_status(job_type, identity, id, Status::Canceled).await?;
                Ok(Status::Canceled)
            }
            Status::Running => {
                self.set_status(job_type, identity, id, Status::Canceling).await?;
                self.ci_builder.cancel_ci_builder_job(&job).await?;
                info!(job = %job, "Canceling executor job");
                Ok(Status::Canceling)
            }
            Status::Canceling => {
                self.ci_builder.cancel_ci_builder_job(&job).await?;
                self.set_status(job_type, identity, id, Status::Canceled).await?;
                info!(job = %job, "Executor job canceled");
                Ok(Status::Canceled)
            }
            terminal => {
                debug!(job = %job, status = %terminal, "Nothing to cancel");
                Ok(terminal)
            }
        }
    }

}

#[async_trait]
impl BuildService for CiBuildService {
    async fn create_build(&self, mut build: Build, wait_for_start: bool) -> ServiceResult<Build> {
        let (manifest, mut failure) = match parse_manifest(&build.manifest) {
            Ok(manifest) => (manifest, None),
            Err(e) => (Manifest::default(), Some(format!("invalid manifest: {e}"))),
        };

        let version = self
            .versions
            .resolve(
                &build.identity,
                &manifest.version,
                &build.branch,
                &build.revision,
                build.version.as_deref(),
            )
            .await?;
        build.version = Some(version.version.clone());

        if build.labels.is_empty() {
            build.labels = manifest.labels.clone();
        }
        if build.release_targets.is_empty() {
            build.release_targets = manifest.release_targets.clone();
        }
        if build.triggers.is_empty() {
            build.triggers = manifest.triggers.clone();
        }

        let git = if failure.is_none() {
            match self.git.job_vars(&build.identity).await {
                Ok(vars) => Some(vars),
                Err(e @ convoy_core::Error::UnsupportedSource(_)) => {
                    failure = Some(e.to_string());
                    None
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        build.status = if failure.is_some() { Status::Failed } else { Status::Running };

        let resources = self.job_resources(&build.identity).await;
        let build = self.repo.insert_build(&build, &resources).await?;
        info!(
            pipeline = %build.identity,
            build_id = build.id,
            version = %version.version,
            status = %build.status,
            "Created build"
        );

        let git = match (git, failure) {
            (Some(git), None) => git,
            (_, failure) => {
                let message = failure.unwrap_or_default();
                warn!(pipeline = %build.identity, build_id = build.id, reason = %message, "Build will not run");
                self.record_validation_failure(&build, &message).await;
                return Ok(build);
            }
        };

        let params = BuildJobParams {
            job_type: JobType::Build,
            identity: build.identity.clone(),
            branch: build.branch.clone(),
            revision: build.revision.clone(),
            git_url: git.clone_url,
            git_token: Some(git.token),
            env_vars: git.env_vars,
            track: manifest.builder.track.clone(),
            version,
            manifest,
            build_id: build.id,
            release_id: None,
            release_name: None,
            release_action: None,
            triggered_by: build.triggered_by.clone(),
            resources,
        };

        self.launch(params, Subject::Build(build.clone()), wait_for_start)
            .await?;
        Ok(build)
    }

    async fn finish_build(&self, identity: &PipelineIdentity, id: i64, status: Status) -> ServiceResult<()> {
        if !status.is_terminal() {
            return Err(ServiceError::InvalidRequest(format!(
                "build cannot finish with status {status}"
            )));
        }
        self.repo.update_build_status(identity, id, status).await?;
        info!(pipeline = %identity, build_id = id, status = %status, "Finished build");

        let svc = self.clone();
        let identity = identity.clone();
        self.queue.submit_or_run(format!("finished-build-{identity}-{id}"), async move {
            match svc.repo.get_build_by_id(&identity, id).await {
                Ok(build) => {
                    if let Err(e) = svc.fire_pipeline_triggers(&build, TriggerEvent::Finished).await {
                        warn!(pipeline = %identity, build_id = id, error = %e, "Failed to fire finished triggers");
                    }
                }
                Err(e) => warn!(pipeline = %identity, build_id = id, error = %e, "Failed to re-fetch finished build"),
            }
        })
        .await;
        Ok(())
    }

    async fn create_release(&self, mut release: Release, wait_for_start: bool) -> ServiceResult<Release> {
        let build = self
            .repo
            .get_build_by_version(&release.identity, &release.version)
            .await?
            .ok_or_else(|| {
                ServiceError::InvalidRequest(format!(
                    "no build {} of {} to release",
                    release.version, release.identity
                ))
            })?;
        if build.status != Status::Succeeded {
            return Err(ServiceError::InvalidRequest(format!(
                "build {} of {} has status {}, only succeeded builds can be released",
                release.version, release.identity, build.status
            )));
        }

        let manifest = parse_manifest(&build.manifest)
            .map_err(|e| convoy_core::Error::InvalidManifest(e.to_string()))?;
        let target = manifest
            .release_targets
            .iter()
            .find(|t| t.name == release.name)
            .ok_or_else(|| ServiceError::InvalidRequest(format!("unknown release target {}", release.name)))?;
        match release.action.as_deref() {
            None if !target.actions.is_empty() => {
                return Err(ServiceError::InvalidRequest(format!(
                    "release target {} requires one of the actions {:?}",
                    target.name, target.actions
                )));
            }
            Some(action) if !target.actions.iter().any(|a| a == action) => {
                return Err(ServiceError::InvalidRequest(format!(
                    "release target {} has no action {action}",
                    target.name
                )));
            }
            _ => {}
        }

        let version = self
            .versions
            .resolve(
                &release.identity,
                &manifest.version,
                &build.branch,
                &build.revision,
                Some(&release.version),
            )
            .await?;
        let git = self.git.job_vars(&release.identity).await?;

        release.status = Status::Running;
        let resources = self.job_resources(&release.identity).await;
        let release = self.repo.insert_release(&release, &resources).await?;
        info!(
            pipeline = %release.identity,
            release_id = release.id,
            target = %release.name,
            version = %release.version,
            "Created release"
        );

        let params = BuildJobParams {
            job_type: JobType::Release,
            identity: release.identity.clone(),
            branch: build.branch.clone(),
            revision: build.revision.clone(),
            git_url: git.clone_url,
            git_token: Some(git.token),
            env_vars: git.env_vars,
            track: manifest.builder.track.clone(),
            version,
            manifest,
            build_id: build.id,
            release_id: Some(release.id),
            release_name: Some(release.name.clone()),
            release_action: release.action.clone(),
            triggered_by: release.triggered_by.clone(),
            resources,
        };

        self.launch(params, Subject::Release(release.clone()), wait_for_start)
            .await?;
        Ok(release)
    }

    async fn finish_release(&self, identity: &PipelineIdentity, id: i64, status: Status) -> ServiceResult<()> {
        if !status.is_terminal() {
            return Err(ServiceError::InvalidRequest(format!(
                "release cannot finish with status {status}"
            )));
        }
        self.repo.update_release_status(identity, id, status).await?;
        info!(pipeline = %identity, release_id = id, status = %status, "Finished release");

        let svc = self.clone();
        let identity = identity.clone();
        self.queue.submit_or_run(format!("finished-release-{identity}-{id}"), async move {
            match svc.repo.get_release_by_id(&identity, id).await {
                Ok(release) => {
                    if let Err(e) = svc.fire_release_triggers(&release, TriggerEvent::Finished).await {
                        warn!(pipeline = %identity, release_id = id, error = %e, "Failed to fire finished triggers");
                    }
                }
                Err(e) => warn!(pipeline = %identity, release_id = id, error = %e, "Failed to re-fetch finished release"),
            }
        })
        .await;
        Ok(())
    }

    async fn cancel_build(&self, identity: &PipelineIdentity, id: i64) -> ServiceResult<Status> {
        let build = self.repo.get_build_by_id(identity, id).await?;
        self.cancel(JobType::Build, identity, id, build.status).await
    }

    async fn cancel_release(&self, identity: &PipelineIdentity, id: i64) -> ServiceResult<Status> {
        let release = self.repo.get_release_by_id(identity, id).await?;
        self.cancel(JobType::Release, identity, id, release.status).await
    }

    async fn update_build_resource_utilization(
        &self,
        identity: &PipelineIdentity,
        id: i64,
        utilization: ResourceUtilization,
    ) -> ServiceResult<()> {
        self.repo
            .update_build_resource_utilization(identity, id, &utilization)
            .await?;
        Ok(())
    }

    async fn update_release_resource_utilization(
        &self,
        identity: &PipelineIdentity,
        id: i64,
        utilization: ResourceUtilization,
    ) -> ServiceResult<()> {
        self.repo
            .update_release_resource_utilization(identity, id, &utilization)
            .await?;
        Ok(())
    }

    async fn fire_pipeline_triggers(&self, build: &Build, event: TriggerEvent) -> ServiceResult<()> {
        let pipelines = self.repo.get_pipeline_triggers(build, event).await?;
        let dispatched = self
            .dispatch_triggers(pipelines, |filter| {
                matches!(filter, TriggerFilter::Pipeline(t) if t.fires(build, event))
            })
            .await;
        debug!(pipeline = %build.identity, build_id = build.id, event = %event, dispatched, "Fired pipeline triggers");
        Ok(())
    }

    async fn fire_release_triggers(&self, release: &Release, event: TriggerEvent) -> ServiceResult<()> {
        let pipelines = self.repo.get_release_triggers(release, event).await?;
        let dispatched = self
            .dispatch_triggers(pipelines, |filter| {
                matches!(filter, TriggerFilter::Release(t) if t.fires(release, event))
            })
            .await;
        debug!(pipeline = %release.identity, release_id = release.id, event = %event, dispatched, "Fired release triggers");
        Ok(())
    }

    async fn fire_cron_triggers(&self, at: DateTime<Utc>) -> ServiceResult<()> {
        let pipelines = self.repo.get_cron_triggers().await?;
        let dispatched = self
            .dispatch_triggers(pipelines, |filter| {
                matches!(filter, TriggerFilter::Cron(t) if t.fires(at))
            })
            .await;
        debug!(at = %at, dispatched, "Fired cron triggers");
        Ok(())
    }

    async fn fire_git_triggers(&self, event: &GitEvent) -> ServiceResult<()> {
        let pipelines = self.repo.get_git_triggers(event).await?;
        let dispatched = self
            .dispatch_triggers(pipelines, |filter| {
                matches!(filter, TriggerFilter::Git(t) if t.fires(event))
            })
            .await;
        debug!(repository = %event.repository, branch = %event.branch, dispatched, "Fired git triggers");
        Ok(())
    }

    async fn fire_pubsub_triggers(&self, event: &PubSubEvent) -> ServiceResult<()> {
        let pipelines = self.repo.get_pubsub_triggers(event).await?;
        let dispatched = self
            .dispatch_triggers(pipelines, |filter| {
                matches!(filter, TriggerFilter::Pubsub(t) if t.fires(event))
            })
            .await;
        debug!(project = %event.project, topic = %event.topic, dispatched, "Fired pubsub triggers");
        Ok(())
    }
}

/// Prepare a previous build to be built again because a trigger fired.
pub(crate) fn rebuild_of(mut build: Build) -> Build {
    build.id = 0;
    build.version = None;
    build.status = Status::Pending;
    build.triggered_by = Some(TRIGGERED_BY_TRIGGER.to_string());
    build.inserted_at = None;
    build
}
