//! Kubernetes implementation of the cluster API.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{AsyncBufReadExt, SinkExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, WatchEvent, WatchParams};
use std::time::Duration;
use tracing::debug;

use crate::cluster::{ClusterApi, JobPhase, PodInfo, PodPhase};
use crate::job_spec::CONTAINER_NAME;
use crate::{ExecResult, ExecutorError};

/// The API server rejects watch timeouts of 295s and above.
const MAX_SERVER_WATCH_SECS: u64 = 290;

pub struct KubeClusterApi {
    client: Client,
    namespace: String,
}

impl KubeClusterApi {
    pub async fn new(namespace: impl Into<String>) -> ExecResult<Self> {
        let client = Client::try_default().await?;
        Ok(Self::with_client(client, namespace))
    }

    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn watch_params(name: &str, timeout: Duration) -> WatchParams {
    let secs = timeout.as_secs().clamp(1, MAX_SERVER_WATCH_SECS) as u32;
    WatchParams::default()
        .fields(&format!("metadata.name={name}"))
        .timeout(secs)
}

fn job_phase(job: &Job) -> JobPhase {
    let Some(status) = job.status.as_ref() else {
        return JobPhase::Active;
    };

    let condition = |kind: &str| {
        status
            .conditions
            .iter()
            .flatten()
            .any(|c| c.type_ == kind && c.status == "True")
    };

    if condition("Complete") || status.succeeded.unwrap_or(0) > 0 {
        JobPhase::Succeeded
    } else if condition("Failed") {
        JobPhase::Failed
    } else {
        JobPhase::Active
    }
}

fn pod_phase(pod: &Pod) -> PodPhase {
    PodPhase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref()))
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn create_config_map(&self, config_map: ConfigMap) -> ExecResult<()> {
        self.config_maps()
            .create(&PostParams::default(), &config_map)
            .await?;
        Ok(())
    }

    async fn create_secret(&self, secret: Secret) -> ExecResult<()> {
        self.secrets().create(&PostParams::default(), &secret).await?;
        Ok(())
    }

    async fn create_job(&self, job: Job) -> ExecResult<()> {
        self.jobs().create(&PostParams::default(), &job).await?;
        Ok(())
    }

    async fn get_job_phase(&self, name: &str) -> ExecResult<JobPhase> {
        let job = self.jobs().get(name).await?;
        Ok(job_phase(&job))
    }

    async fn delete_job(&self, name: &str) -> ExecResult<()> {
        self.jobs().delete(name, &DeleteParams::background()).await?;
        Ok(())
    }

    async fn delete_config_map(&self, name: &str) -> ExecResult<()> {
        self.config_maps().delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> ExecResult<()> {
        self.secrets().delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn watch_job_until_succeeded(&self, name: &str, timeout: Duration) -> ExecResult<()> {
        let jobs = self.jobs();
        let params = watch_params(name, timeout);

        let watch = async {
            let mut events = Box::pin(jobs.watch(&params, "0").await?);
            while let Some(event) = events.try_next().await? {
                match event {
                    WatchEvent::Added(job) | WatchEvent::Modified(job) => {
                        let phase = job_phase(&job);
                        debug!(job = %name, ?phase, "Job event");
                        if phase == JobPhase::Succeeded {
                            return Ok(());
                        }
                    }
                    WatchEvent::Deleted(_) => return Ok(()),
                    WatchEvent::Error(e) => return Err(ExecutorError::Kube(kube::Error::Api(e))),
                    WatchEvent::Bookmark(_) => {}
                }
            }
            Ok::<_, ExecutorError>(())
        };

        tokio::time::timeout(timeout, watch)
            .await
            .map_err(|_| ExecutorError::Timeout(format!("job {name}")))?
    }

    async fn list_job_pods(&self, job_name: &str) -> ExecResult<Vec<PodInfo>> {
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&format!("job-name={job_name}")))
            .await?;

        Ok(pods
            .items
            .iter()
            .filter_map(|pod| {
                pod.metadata.name.clone().map(|name| PodInfo {
                    name,
                    phase: pod_phase(pod),
                })
            })
            .collect())
    }

    async fn watch_pod_until_started(&self, pod_name: &str, timeout: Duration) -> ExecResult<PodPhase> {
        let pods = self.pods();
        let params = watch_params(pod_name, timeout);

        let watch = async {
            let mut events = Box::pin(pods.watch(&params, "0").await?);
            while let Some(event) = events.try_next().await? {
                match event {
                    WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                        let phase = pod_phase(&pod);
                        if phase != PodPhase::Pending {
                            return Ok(phase);
                        }
                    }
                    WatchEvent::Deleted(_) => return Ok(PodPhase::Unknown),
                    WatchEvent::Error(e) => return Err(ExecutorError::Kube(kube::Error::Api(e))),
                    WatchEvent::Bookmark(_) => {}
                }
            }
            Ok::<_, ExecutorError>(PodPhase::Pending)
        };

        tokio::time::timeout(timeout, watch)
            .await
            .map_err(|_| ExecutorError::Timeout(format!("pod {pod_name}")))?
    }

    async fn follow_pod_logs(&self, pod_name: &str, mut lines: mpsc::Sender<String>) -> ExecResult<()> {
        let pods = self.pods();
        let params = LogParams {
            container: Some(CONTAINER_NAME.to_string()),
            follow: true,
            ..LogParams::default()
        };

        let reader = pods.log_stream(pod_name, &params).await?;
        let mut stream = Box::pin(reader.lines());
        while let Some(line) = stream.try_next().await? {
            if lines.send(line).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}
