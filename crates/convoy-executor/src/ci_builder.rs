//! Executor job lifecycle: create, remove, cancel and tail.

use async_trait::async_trait;
use chrono::Utc;
use convoy_config::ConfigHandle;
use convoy_core::PipelineIdentity;
use convoy_core::executor::{BuildJobParams, CiBuilderClient, JobType, TailLogLine};
use convoy_core::secret::SecretCodec;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::builder_config::BuilderConfig;
use crate::cluster::{ClusterApi, JobPhase, PodPhase};
use crate::image::ImageResolver;
use crate::job_spec::{self, JobSpecInput};
use crate::naming::job_name;
use crate::token::JobTokenSigner;
use crate::{ExecResult, ExecutorError};

/// Upper bound on any single wait for cluster state.
pub const WATCH_TIMEOUT: Duration = Duration::from_secs(300);

const LOG_LINE_BUFFER: usize = 64;

/// Shape of one structured line of executor output.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutorLogRecord {
    #[serde(default)]
    tail_log_line: Option<TailLogLine>,
}

/// Runs builds and releases as Kubernetes jobs, each paired with a config
/// map and a secret of the same name.
pub struct CiBuilderJobClient {
    cluster: Arc<dyn ClusterApi>,
    config: ConfigHandle,
    codec: Arc<dyn SecretCodec>,
    images: ImageResolver,
    watch_timeout: Duration,
}

impl CiBuilderJobClient {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        config: ConfigHandle,
        codec: Arc<dyn SecretCodec>,
        images: ImageResolver,
    ) -> Self {
        Self {
            cluster,
            config,
            codec,
            images,
            watch_timeout: WATCH_TIMEOUT,
        }
    }

    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    /// Delete the job, config map and secret independently. Objects that are
    /// already gone count as deleted.
    async fn delete_job_objects(&self, job_name: &str) {
        log_cleanup(job_name, "job", self.cluster.delete_job(job_name).await);
        log_cleanup(job_name, "config map", self.cluster.delete_config_map(job_name).await);
        log_cleanup(job_name, "secret", self.cluster.delete_secret(job_name).await);
    }
}

fn log_cleanup(job_name: &str, kind: &str, result: ExecResult<()>) {
    match result {
        Ok(()) => debug!(job = %job_name, kind, "Deleted"),
        Err(e) if e.is_not_found() => debug!(job = %job_name, kind, "Already deleted"),
        Err(e) => warn!(job = %job_name, kind, error = %e, "Cleanup failed"),
    }
}

/// Forward well-formed tail records from raw pod output into `sink`.
async fn forward_tail_lines(
    job_name: &str,
    pod_name: &str,
    mut lines: mpsc::Receiver<String>,
    sink: &mut mpsc::Sender<TailLogLine>,
) {
    while let Some(line) = lines.next().await {
        match serde_json::from_str::<ExecutorLogRecord>(&line) {
            Ok(ExecutorLogRecord {
                tail_log_line: Some(record),
            }) => {
                if sink.send(record).await.is_err() {
                    debug!(job = %job_name, "Log sink closed, stop tailing");
                    break;
                }
            }
            Ok(_) => debug!(job = %job_name, pod = %pod_name, "Skipping line without tail record"),
            Err(e) => warn!(job = %job_name, pod = %pod_name, error = %e, "Skipping malformed log line"),
        }
    }
}

#[async_trait]
impl CiBuilderClient for CiBuilderJobClient {
    async fn create_ci_builder_job(&self, params: BuildJobParams) -> convoy_core::Result<String> {
        let config = self.config.snapshot();
        let job_name = self.get_job_name(params.job_type, &params.identity, params.job_id());

        let track = if params.track.is_empty() {
            config.jobs.default_track.as_str()
        } else {
            params.track.as_str()
        };
        let image = self
            .images
            .resolve(&config.jobs.builder_image, track, config.jobs.pin_digest)
            .await;

        let jwt = JobTokenSigner::new(&config.job_token.secret, config.job_token.validity_hours)
            .sign(&job_name, Utc::now())?;
        let blob = serde_json::to_string(&BuilderConfig::new(&params, &config, &job_name, jwt))
            .map_err(ExecutorError::from)?;
        let (blob, decryption_key) = self
            .codec
            .reencrypt_all_envelopes(&blob, &params.identity.full_name())?;

        let input = JobSpecInput {
            job_name: &job_name,
            params: &params,
            image: &image,
            jobs: &config.jobs,
        };

        info!(job = %job_name, image = %image.image, pipeline = %params.identity, "Creating executor job");

        // A failed job creation leaves the config map and secret behind;
        // callers clean up through remove/cancel.
        self.cluster
            .create_config_map(job_spec::config_map(&input, blob))
            .await?;
        self.cluster
            .create_secret(job_spec::secret(&input, decryption_key))
            .await?;
        self.cluster.create_job(job_spec::job(&input)).await?;

        Ok(job_name)
    }

    async fn remove_ci_builder_job(&self, job_name: &str) -> convoy_core::Result<()> {
        match self.cluster.get_job_phase(job_name).await {
            Ok(JobPhase::Succeeded) => {
                debug!(job = %job_name, "Job already succeeded");
            }
            Ok(phase) => {
                debug!(job = %job_name, ?phase, "Waiting for job to succeed");
                if let Err(e) = self
                    .cluster
                    .watch_job_until_succeeded(job_name, self.watch_timeout)
                    .await
                {
                    warn!(job = %job_name, error = %e, "Job watch ended without success");
                }
            }
            Err(e) if e.is_not_found() => {
                debug!(job = %job_name, "Job already gone");
            }
            Err(e) => {
                warn!(job = %job_name, error = %e, "Failed to read job state");
            }
        }

        self.delete_job_objects(job_name).await;
        info!(job = %job_name, "Removed executor job");
        Ok(())
    }

    /// Succeeds only once the job no longer exists; config map and secret
    /// cleanup stays best-effort.
    async fn cancel_ci_builder_job(&self, job_name: &str) -> convoy_core::Result<()> {
        info!(job = %job_name, "Canceling executor job");
        let deleted = self.cluster.delete_job(job_name).await;
        log_cleanup(job_name, "config map", self.cluster.delete_config_map(job_name).await);
        log_cleanup(job_name, "secret", self.cluster.delete_secret(job_name).await);

        match deleted {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(job = %job_name, "Job already gone");
                Ok(())
            }
            Err(e) => {
                warn!(job = %job_name, error = %e, "Failed to delete job");
                Err(e.into())
            }
        }
    }

    async fn tail_ci_builder_job_logs(
        &self,
        job_name: &str,
        mut sink: mpsc::Sender<TailLogLine>,
    ) -> convoy_core::Result<()> {
        let pods = self.cluster.list_job_pods(job_name).await?;

        for pod in pods {
            let phase = if pod.phase == PodPhase::Pending {
                match self
                    .cluster
                    .watch_pod_until_started(&pod.name, self.watch_timeout)
                    .await
                {
                    Ok(phase) => phase,
                    Err(e) => {
                        warn!(job = %job_name, pod = %pod.name, error = %e, "Pod did not start");
                        continue;
                    }
                }
            } else {
                pod.phase
            };

            if phase != PodPhase::Running {
                debug!(job = %job_name, pod = %pod.name, ?phase, "Pod not running, skipping");
                continue;
            }

            let (lines_tx, lines_rx) = mpsc::channel(LOG_LINE_BUFFER);
            let follow = self.cluster.follow_pod_logs(&pod.name, lines_tx);
            let forward = forward_tail_lines(job_name, &pod.name, lines_rx, &mut sink);
            let (followed, ()) = futures::join!(follow, forward);

            if let Err(e) = followed {
                warn!(job = %job_name, pod = %pod.name, error = %e, "Log stream ended with error");
            }
        }

        // Dropping the sink closes it for the receiver.
        drop(sink);
        Ok(())
    }

    fn get_job_name(&self, job_type: JobType, identity: &PipelineIdentity, id: i64) -> String {
        job_name(job_type, identity, id)
    }
}
