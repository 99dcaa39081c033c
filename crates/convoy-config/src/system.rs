//! Server configuration parsing.
//!
//! The parsed configuration is an immutable snapshot. [`ConfigHandle`] hands
//! out `Arc` snapshots and swaps the whole snapshot on reload, so a reader
//! never observes a half-applied configuration.

use crate::nodes::*;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Server-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub ci_server: CiServerConfig,
    pub job_token: JobTokenConfig,
    pub jobs: JobsConfig,
    pub registry_mirror: Option<String>,
    pub docker_network: Option<DockerNetworkConfig>,
    pub docker_mtu: Option<u32>,
    pub credentials: Vec<CredentialConfig>,
    pub trusted_images: Vec<TrustedImageConfig>,
    pub git_providers: Vec<GitProviderConfig>,
    /// Hex-encoded AES-256 key for secret envelopes.
    pub secret_key: Option<String>,
    pub work_queue: WorkQueueConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiServerConfig {
    pub base_url: String,
    pub events_url: String,
    pub post_logs_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTokenConfig {
    pub secret: String,
    pub validity_hours: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsConfig {
    pub namespace: String,
    /// Image repository of the executor, tagged with the track.
    pub builder_image: String,
    pub default_track: String,
    /// Pin the executor image to its content digest.
    pub pin_digest: bool,
    pub digest_cache_ttl_secs: u64,
    /// Node label marking low-priority (preemptible) nodes.
    pub low_priority_node_label: String,
    pub os_label: String,
    pub cpu: ResourceBounds,
    pub memory: ResourceBounds,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            namespace: "convoy-ci".to_string(),
            builder_image: "convoy/convoy-ci-builder".to_string(),
            default_track: "stable".to_string(),
            pin_digest: false,
            digest_cache_ttl_secs: 300,
            low_priority_node_label: "cloud.google.com/gke-preemptible".to_string(),
            os_label: "kubernetes.io/os".to_string(),
            cpu: ResourceBounds {
                min: 0.2,
                max: 7.0,
                request_ratio: 1.0,
                default_request: 1.0,
                default_limit: 2.0,
            },
            memory: ResourceBounds {
                min: 128.0 * 1024.0 * 1024.0,
                max: 20.0 * 1024.0 * 1024.0 * 1024.0,
                request_ratio: 1.25,
                default_request: 2.0 * 1024.0 * 1024.0 * 1024.0,
                default_limit: 4.0 * 1024.0 * 1024.0 * 1024.0,
            },
        }
    }
}

/// Bounds used to size job resources from recorded utilisation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceBounds {
    pub min: f64,
    pub max: f64,
    pub request_ratio: f64,
    pub default_request: f64,
    pub default_limit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerNetworkConfig {
    pub name: String,
    pub subnet: String,
    pub gateway: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub credential_type: String,
    /// Values may be secret envelopes.
    pub additional_properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedImageConfig {
    /// Image path without tag, e.g. `extensions/docker`.
    pub path: String,
    pub run_privileged: bool,
    pub run_docker: bool,
    pub injected_credential_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitProviderConfig {
    /// Git host, e.g. `github.com`.
    pub source: String,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkQueueConfig {
    pub capacity: usize,
    pub workers: usize,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            workers: 8,
        }
    }
}

/// Read and parse a server configuration file.
pub fn load_server_config(path: impl AsRef<Path>) -> ConfigResult<ServerConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_server_config(&text)
}

/// Parse server configuration from KDL text.
pub fn parse_server_config(kdl: &str) -> ConfigResult<ServerConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut ci_server = None;
    let mut job_token = None;
    let mut jobs = JobsConfig::default();
    let mut registry_mirror = None;
    let mut docker_network = None;
    let mut docker_mtu = None;
    let mut credentials = Vec::new();
    let mut trusted_images = Vec::new();
    let mut git_providers = Vec::new();
    let mut secret_key = None;
    let mut work_queue = WorkQueueConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "ci-server" => {
                let base_url = required(node, "base-url", "ci-server base-url")?;
                let base = base_url.trim_end_matches('/').to_string();
                ci_server = Some(CiServerConfig {
                    events_url: get_string_prop(node, "events-url")
                        .unwrap_or_else(|| format!("{base}/api/commands")),
                    post_logs_url: get_string_prop(node, "post-logs-url")
                        .unwrap_or_else(|| format!("{base}/api/pipelines")),
                    base_url,
                });
            }
            "job-token" => {
                job_token = Some(JobTokenConfig {
                    secret: required(node, "secret", "job-token secret")?,
                    validity_hours: get_integer_prop(node, "validity-hours")
                        .map(|h| h as i64)
                        .unwrap_or(6),
                });
            }
            "jobs" => {
                jobs = parse_jobs(node)?;
            }
            "registry-mirror" => {
                registry_mirror = get_first_string_arg(node);
            }
            "docker-network" => {
                docker_network = Some(DockerNetworkConfig {
                    name: required(node, "name", "docker-network name")?,
                    subnet: required(node, "subnet", "docker-network subnet")?,
                    gateway: required(node, "gateway", "docker-network gateway")?,
                });
            }
            "docker-mtu" => {
                docker_mtu = get_integer_arg(node)
                    .map(|mtu| {
                        u32::try_from(mtu).map_err(|_| invalid("docker-mtu", "out of range"))
                    })
                    .transpose()?;
            }
            "credentials" => {
                for child in children_named(node, "credential") {
                    credentials.push(CredentialConfig {
                        name: get_first_string_arg(child)
                            .ok_or_else(|| ConfigError::MissingField("credential name".to_string()))?,
                        credential_type: required(child, "type", "credential type")?,
                        additional_properties: get_string_map(child.children()),
                    });
                }
            }
            "trusted-images" => {
                for child in children_named(node, "image") {
                    trusted_images.push(TrustedImageConfig {
                        path: get_first_string_arg(child)
                            .ok_or_else(|| ConfigError::MissingField("trusted image path".to_string()))?,
                        run_privileged: get_bool_prop(child, "run-privileged").unwrap_or(false),
                        run_docker: get_bool_prop(child, "run-docker").unwrap_or(false),
                        injected_credential_types: get_string_list_prop(
                            child,
                            "injected-credential-types",
                        ),
                    });
                }
            }
            "git-providers" => {
                for child in children_named(node, "provider") {
                    git_providers.push(GitProviderConfig {
                        source: get_first_string_arg(child)
                            .ok_or_else(|| ConfigError::MissingField("git provider source".to_string()))?,
                        token: required(child, "token", "git provider token")?,
                    });
                }
            }
            "secret-key" => {
                secret_key = get_first_string_arg(node);
            }
            "work-queue" => {
                let defaults = WorkQueueConfig::default();
                work_queue = WorkQueueConfig {
                    capacity: positive(node, "capacity")?.unwrap_or(defaults.capacity),
                    workers: positive(node, "workers")?.unwrap_or(defaults.workers),
                };
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(ServerConfig {
        ci_server: ci_server.ok_or_else(|| ConfigError::MissingField("ci-server".to_string()))?,
        job_token: job_token.ok_or_else(|| ConfigError::MissingField("job-token".to_string()))?,
        jobs,
        registry_mirror,
        docker_network,
        docker_mtu,
        credentials,
        trusted_images,
        git_providers,
        secret_key,
        work_queue,
    })
}

fn parse_jobs(node: &KdlNode) -> ConfigResult<JobsConfig> {
    let defaults = JobsConfig::default();
    let mut jobs = JobsConfig {
        namespace: get_string_prop(node, "namespace").unwrap_or(defaults.namespace),
        builder_image: get_string_prop(node, "builder-image").unwrap_or(defaults.builder_image),
        default_track: get_string_prop(node, "default-track").unwrap_or(defaults.default_track),
        pin_digest: get_bool_prop(node, "pin-digest").unwrap_or(defaults.pin_digest),
        digest_cache_ttl_secs: get_integer_prop(node, "digest-cache-ttl")
            .map(|s| s.max(0) as u64)
            .unwrap_or(defaults.digest_cache_ttl_secs),
        low_priority_node_label: get_string_prop(node, "low-priority-node-label")
            .unwrap_or(defaults.low_priority_node_label),
        os_label: get_string_prop(node, "os-label").unwrap_or(defaults.os_label),
        cpu: defaults.cpu,
        memory: defaults.memory,
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "cpu" => jobs.cpu = parse_bounds(child, defaults.cpu)?,
                "memory" => jobs.memory = parse_bounds(child, defaults.memory)?,
                _ => {}
            }
        }
    }

    Ok(jobs)
}

fn parse_bounds(node: &KdlNode, defaults: ResourceBounds) -> ConfigResult<ResourceBounds> {
    let field = node.name().value();
    let bounds = ResourceBounds {
        min: get_number_prop(node, "min").unwrap_or(defaults.min),
        max: get_number_prop(node, "max").unwrap_or(defaults.max),
        request_ratio: get_number_prop(node, "request-ratio").unwrap_or(defaults.request_ratio),
        default_request: get_number_prop(node, "default-request").unwrap_or(defaults.default_request),
        default_limit: get_number_prop(node, "default-limit").unwrap_or(defaults.default_limit),
    };

    if bounds.min <= 0.0 || bounds.min > bounds.max {
        return Err(invalid(field, "min must be positive and not exceed max"));
    }
    if bounds.request_ratio <= 0.0 {
        return Err(invalid(field, "request-ratio must be positive"));
    }
    if bounds.default_request > bounds.default_limit {
        return Err(invalid(field, "default-request must not exceed default-limit"));
    }
    Ok(bounds)
}

fn children_named<'a>(node: &'a KdlNode, name: &'a str) -> impl Iterator<Item = &'a KdlNode> + 'a {
    node.children()
        .into_iter()
        .flat_map(|c| c.nodes())
        .filter(move |c| c.name().value() == name)
}

fn required(node: &KdlNode, name: &str, what: &str) -> ConfigResult<String> {
    get_string_prop(node, name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingField(what.to_string()))
}

fn positive(node: &KdlNode, name: &str) -> ConfigResult<Option<usize>> {
    match get_integer_prop(node, name) {
        None => Ok(None),
        Some(v) if v > 0 => Ok(Some(v as usize)),
        Some(_) => Err(invalid(name, "must be positive")),
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Shared handle to the current configuration snapshot.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<ServerConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// The configuration in effect right now.
    pub fn snapshot(&self) -> Arc<ServerConfig> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Swap in a new snapshot. Holders of older snapshots keep them.
    pub fn replace(&self, config: ServerConfig) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(config);
    }

    /// Re-read `path`; the current snapshot is kept if the file is invalid.
    pub fn reload(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let config = load_server_config(path)?;
        self.replace(config);
        Ok(())
    }
}
