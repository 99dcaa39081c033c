//! Kubernetes objects making up one executor job.

use convoy_config::JobsConfig;
use convoy_core::JobResources;
use convoy_core::executor::{BuildJobParams, JobType};
use k8s_openapi::ByteString;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    HostPathVolumeSource, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    ObjectFieldSelector, PodSpec, PodTemplateSpec, PreferredSchedulingTerm, ResourceRequirements, Secret,
    SecretVolumeSource, SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

use crate::image::ResolvedImage;

pub const CONTAINER_NAME: &str = "convoy-ci-builder";
pub const SERVICE_ACCOUNT: &str = "convoy-ci-builder";
pub const CONFIG_FILE: &str = "builder-config.json";
pub const DECRYPTION_KEY_FILE: &str = "secretDecryptionKey";

const CONFIG_MOUNT: &str = "/configs";
const SECRET_MOUNT: &str = "/secrets";
const WINDOWS_CONFIG_MOUNT: &str = "C:/configs";
const WINDOWS_SECRET_MOUNT: &str = "C:/secrets";
const WINDOWS_WORK_DIR: &str = "C:/convoy-work";
const WINDOWS_DOCKER_PIPE: &str = r"\\.\pipe\docker_engine";
const WINDOWS_DOCKER_TOOLS: &str = "C:/Program Files/Docker";

/// Everything the job manifest is assembled from.
pub struct JobSpecInput<'a> {
    pub job_name: &'a str,
    pub params: &'a BuildJobParams,
    pub image: &'a ResolvedImage,
    pub jobs: &'a JobsConfig,
}

fn labels(input: &JobSpecInput<'_>) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("createdBy".to_string(), "convoy".to_string()),
        ("jobType".to_string(), input.params.job_type.as_str().to_string()),
    ])
}

fn metadata(input: &JobSpecInput<'_>) -> ObjectMeta {
    ObjectMeta {
        name: Some(input.job_name.to_string()),
        namespace: Some(input.jobs.namespace.clone()),
        labels: Some(labels(input)),
        ..ObjectMeta::default()
    }
}

/// Non-secret configuration, mounted as `builder-config.json`.
pub fn config_map(input: &JobSpecInput<'_>, blob: String) -> ConfigMap {
    ConfigMap {
        metadata: metadata(input),
        data: Some(BTreeMap::from([(CONFIG_FILE.to_string(), blob)])),
        ..ConfigMap::default()
    }
}

/// The job-specific key decrypting the envelopes inside the blob.
pub fn secret(input: &JobSpecInput<'_>, decryption_key: String) -> Secret {
    Secret {
        metadata: metadata(input),
        data: Some(BTreeMap::from([(
            DECRYPTION_KEY_FILE.to_string(),
            ByteString(decryption_key.into_bytes()),
        )])),
        ..Secret::default()
    }
}

fn resources(resources: &JobResources) -> ResourceRequirements {
    let cpu = |v: f64| Quantity(format!("{v}"));
    let memory = |v: f64| Quantity(format!("{}", v.round() as i64));
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), cpu(resources.cpu_request)),
            ("memory".to_string(), memory(resources.memory_request)),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), cpu(resources.cpu_limit)),
            ("memory".to_string(), memory(resources.memory_limit)),
        ])),
        ..ResourceRequirements::default()
    }
}

fn requirement(key: &str, operator: &str, values: Option<Vec<String>>) -> NodeSelectorRequirement {
    NodeSelectorRequirement {
        key: key.to_string(),
        operator: operator.to_string(),
        values,
    }
}

/// Releases stay off low-priority nodes; builds prefer them. Both require
/// the manifest's OS.
pub fn affinity(job_type: JobType, jobs: &JobsConfig, os: &str) -> Affinity {
    let os_requirement = requirement(&jobs.os_label, "In", Some(vec![os.to_string()]));

    let node_affinity = match job_type {
        JobType::Release => NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![
                        requirement(&jobs.low_priority_node_label, "DoesNotExist", None),
                        os_requirement,
                    ]),
                    ..NodeSelectorTerm::default()
                }],
            }),
            ..NodeAffinity::default()
        },
        JobType::Build => NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![os_requirement]),
                    ..NodeSelectorTerm::default()
                }],
            }),
            preferred_during_scheduling_ignored_during_execution: Some(vec![PreferredSchedulingTerm {
                weight: 10,
                preference: NodeSelectorTerm {
                    match_expressions: Some(vec![requirement(
                        &jobs.low_priority_node_label,
                        "In",
                        Some(vec!["true".to_string()]),
                    )]),
                    ..NodeSelectorTerm::default()
                },
            }]),
        },
    };

    Affinity {
        node_affinity: Some(node_affinity),
        ..Affinity::default()
    }
}

fn tolerations(job_type: JobType, jobs: &JobsConfig) -> Option<Vec<Toleration>> {
    match job_type {
        JobType::Build => Some(vec![Toleration {
            key: Some(jobs.low_priority_node_label.clone()),
            operator: Some("Equal".to_string()),
            value: Some("true".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Toleration::default()
        }]),
        JobType::Release => None,
    }
}

fn env(input: &JobSpecInput<'_>, config_dir: &str, secret_dir: &str) -> Vec<EnvVar> {
    let mut env = vec![
        EnvVar {
            name: "BUILDER_CONFIG_PATH".to_string(),
            value: Some(format!("{config_dir}/{CONFIG_FILE}")),
            ..EnvVar::default()
        },
        EnvVar {
            name: "SECRET_DECRYPTION_KEY_PATH".to_string(),
            value: Some(format!("{secret_dir}/{DECRYPTION_KEY_FILE}")),
            ..EnvVar::default()
        },
        EnvVar {
            name: "POD_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..ObjectFieldSelector::default()
                }),
                ..EnvVarSource::default()
            }),
            ..EnvVar::default()
        },
    ];
    env.extend(input.params.env_vars.iter().map(|(name, value)| EnvVar {
        name: name.clone(),
        value: Some(value.clone()),
        ..EnvVar::default()
    }));
    env
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..VolumeMount::default()
    }
}

fn host_path(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            ..HostPathVolumeSource::default()
        }),
        ..Volume::default()
    }
}

/// The executor job itself.
pub fn job(input: &JobSpecInput<'_>) -> Job {
    let os = input.params.manifest.builder.os.as_str();
    let windows = os == "windows";
    let (config_dir, secret_dir) = if windows {
        (WINDOWS_CONFIG_MOUNT, WINDOWS_SECRET_MOUNT)
    } else {
        (CONFIG_MOUNT, SECRET_MOUNT)
    };

    let mut volumes = vec![
        Volume {
            name: "configs".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: input.job_name.to_string(),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        },
        Volume {
            name: "secrets".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(input.job_name.to_string()),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        },
    ];
    let mut mounts = vec![mount("configs", config_dir), mount("secrets", secret_dir)];

    // Windows runs stages through the node's docker daemon instead of a
    // nested one, so it needs the daemon pipe and client tools.
    if windows {
        volumes.push(Volume {
            name: "work".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        });
        volumes.push(host_path("docker-pipe", WINDOWS_DOCKER_PIPE));
        volumes.push(host_path("docker-tools", WINDOWS_DOCKER_TOOLS));
        mounts.push(mount("work", WINDOWS_WORK_DIR));
        mounts.push(mount("docker-pipe", WINDOWS_DOCKER_PIPE));
        mounts.push(mount("docker-tools", WINDOWS_DOCKER_TOOLS));
    }

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(input.image.image.clone()),
        image_pull_policy: Some(input.image.pull_policy.to_string()),
        env: Some(env(input, config_dir, secret_dir)),
        security_context: (!windows).then(|| SecurityContext {
            privileged: Some(true),
            ..SecurityContext::default()
        }),
        resources: Some(resources(&input.params.resources)),
        volume_mounts: Some(mounts),
        ..Container::default()
    };

    Job {
        metadata: metadata(input),
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            completions: Some(1),
            parallelism: Some(1),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(input)),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(SERVICE_ACCOUNT.to_string()),
                    restart_policy: Some("Never".to_string()),
                    termination_grace_period_seconds: Some(120),
                    containers: vec![container],
                    volumes: Some(volumes),
                    affinity: Some(affinity(input.params.job_type, input.jobs, os)),
                    tolerations: tolerations(input.params.job_type, input.jobs),
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        ..Job::default()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use convoy_core::PipelineIdentity;
    use convoy_core::manifest::{Manifest, VersionTemplate};

    pub(crate) fn params(job_type: JobType, os: &str) -> BuildJobParams {
        let mut manifest = Manifest::default();
        manifest.builder.os = os.to_string();
        BuildJobParams {
            job_type,
            identity: PipelineIdentity::new("github.com", "acme", "app"),
            branch: "main".to_string(),
            revision: "abc123".to_string(),
            git_url: "https://x:t@github.com/acme/app".to_string(),
            git_token: Some("t".to_string()),
            env_vars: BTreeMap::from([("GIT_TOKEN".to_string(), "t".to_string())]),
            track: "stable".to_string(),
            version: VersionTemplate::default().render(7, "main", "abc123"),
            manifest,
            build_id: 42,
            release_id: (job_type == JobType::Release).then_some(9),
            release_name: (job_type == JobType::Release).then(|| "production".to_string()),
            release_action: None,
            triggered_by: None,
            resources: JobResources {
                cpu_request: 0.5,
                cpu_limit: 2.0,
                memory_request: 1073741824.0,
                memory_limit: 2147483648.0,
            },
        }
    }

    fn pod_spec(job: &Job) -> &PodSpec {
        job.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
    }

    fn build(job_type: JobType, os: &str) -> Job {
        let params = params(job_type, os);
        let image = ResolvedImage {
            image: "convoy/convoy-ci-builder:stable".to_string(),
            pull_policy: "Always",
        };
        let jobs = JobsConfig::default();
        job(&JobSpecInput {
            job_name: "build-acme-app-42",
            params: &params,
            image: &image,
            jobs: &jobs,
        })
    }

    #[test]
    fn test_linux_build_job() {
        let job = build(JobType::Build, "linux");
        let spec = pod_spec(&job);
        let container = &spec.containers[0];

        assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(
            container.security_context.as_ref().and_then(|s| s.privileged),
            Some(true)
        );
        let volumes = spec.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].config_map.as_ref().unwrap().name, "build-acme-app-42");
        assert_eq!(
            volumes[1].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("build-acme-app-42")
        );

        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["cpu"], Quantity("2".to_string()));
        assert_eq!(limits["memory"], Quantity("2147483648".to_string()));

        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "GIT_TOKEN"));
    }

    #[test]
    fn test_windows_job_uses_host_daemon() {
        let job = build(JobType::Build, "windows");
        let spec = pod_spec(&job);
        let container = &spec.containers[0];

        assert!(container.security_context.is_none());
        let names: Vec<&str> = spec
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(names, vec!["configs", "secrets", "work", "docker-pipe", "docker-tools"]);
    }

    #[test]
    fn test_release_avoids_low_priority_nodes() {
        let jobs = JobsConfig::default();
        let affinity = affinity(JobType::Release, &jobs, "linux");
        let node = affinity.node_affinity.unwrap();
        assert!(node.preferred_during_scheduling_ignored_during_execution.is_none());

        let terms = node.required_during_scheduling_ignored_during_execution.unwrap();
        let exprs = terms.node_selector_terms[0].match_expressions.clone().unwrap();
        assert_eq!(exprs[0].key, jobs.low_priority_node_label);
        assert_eq!(exprs[0].operator, "DoesNotExist");
        assert_eq!(exprs[1].key, "kubernetes.io/os");
        assert_eq!(exprs[1].values, Some(vec!["linux".to_string()]));
        assert!(tolerations(JobType::Release, &jobs).is_none());
    }

    #[test]
    fn test_build_prefers_low_priority_nodes() {
        let jobs = JobsConfig::default();
        let node = affinity(JobType::Build, &jobs, "linux").node_affinity.unwrap();
        let preferred = node.preferred_during_scheduling_ignored_during_execution.unwrap();
        let exprs = preferred[0].preference.match_expressions.clone().unwrap();
        assert_eq!(exprs[0].key, jobs.low_priority_node_label);
        assert_eq!(exprs[0].operator, "In");
        assert!(node.required_during_scheduling_ignored_during_execution.is_some());
        assert!(tolerations(JobType::Build, &jobs).is_some());
    }
}
