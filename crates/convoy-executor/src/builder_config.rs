//! The configuration blob mounted into every executor container.

use convoy_config::{CiServerConfig, CredentialConfig, DockerNetworkConfig, ServerConfig, TrustedImageConfig};
use convoy_core::executor::{BuildJobParams, JobType};
use convoy_core::manifest::{Manifest, ManifestStage, ResolvedVersion};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

pub const GIT_TOKEN_CREDENTIAL_TYPE: &str = "git-api-token";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderConfig {
    pub action: JobType,
    pub track: String,
    pub git: GitConfig,
    pub version: ResolvedVersion,
    pub job_name: String,
    pub ci_server: CiServerBlob,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_params: Option<BuildParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_params: Option<ReleaseParams>,
    pub credentials: Vec<CredentialConfig>,
    pub trusted_images: Vec<TrustedImageConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_mirror: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_network: Option<DockerNetworkConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_mtu: Option<u32>,
    pub manifest: Manifest,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitConfig {
    pub repo_source: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub repo_branch: String,
    pub repo_revision: String,
    /// Clone URL with the provider token embedded.
    pub repo_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CiServerBlob {
    pub base_url: String,
    pub events_url: String,
    pub post_logs_url: String,
    pub jwt: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildParams {
    pub build_id: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseParams {
    pub release_name: String,
    pub release_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
}

impl BuilderConfig {
    pub fn new(params: &BuildJobParams, config: &ServerConfig, job_name: &str, jwt: String) -> Self {
        let stages = params.manifest.stages_for(params.release_name.as_deref());
        let trusted_images = trusted_images_for(stages, &config.trusted_images);
        let mut credentials = credentials_for(stages, &trusted_images, &config.credentials);

        if let Some(token) = &params.git_token {
            credentials.push(CredentialConfig {
                name: format!("{}-api-token", params.identity.source),
                credential_type: GIT_TOKEN_CREDENTIAL_TYPE.to_string(),
                additional_properties: BTreeMap::from([("token".to_string(), token.clone())]),
            });
        }

        let CiServerConfig {
            base_url,
            events_url,
            post_logs_url,
        } = config.ci_server.clone();

        let (build_params, release_params) = match params.job_type {
            JobType::Build => (
                Some(BuildParams {
                    build_id: params.build_id,
                }),
                None,
            ),
            JobType::Release => (
                None,
                Some(ReleaseParams {
                    release_name: params.release_name.clone().unwrap_or_default(),
                    release_id: params.job_id(),
                    release_action: params.release_action.clone(),
                    triggered_by: params.triggered_by.clone(),
                }),
            ),
        };

        Self {
            action: params.job_type,
            track: params.track.clone(),
            git: GitConfig {
                repo_source: params.identity.source.clone(),
                repo_owner: params.identity.owner.clone(),
                repo_name: params.identity.name.clone(),
                repo_branch: params.branch.clone(),
                repo_revision: params.revision.clone(),
                repo_url: params.git_url.clone(),
            },
            version: params.version.clone(),
            job_name: job_name.to_string(),
            ci_server: CiServerBlob {
                base_url,
                events_url,
                post_logs_url,
                jwt,
            },
            build_params,
            release_params,
            credentials,
            trusted_images,
            registry_mirror: config.registry_mirror.clone(),
            docker_network: config.docker_network.clone(),
            docker_mtu: config.docker_mtu,
            manifest: params.manifest.clone(),
        }
    }
}

/// `repo/image:tag` or `repo/image@digest` without the tag or digest.
fn image_path(image: &str) -> &str {
    let image = image.split('@').next().unwrap_or(image);
    match image.rfind(':') {
        Some(idx) if !image[idx..].contains('/') => &image[..idx],
        _ => image,
    }
}

/// Trusted images used by at least one stage.
pub fn trusted_images_for(stages: &[ManifestStage], trusted: &[TrustedImageConfig]) -> Vec<TrustedImageConfig> {
    let used: BTreeSet<&str> = stages.iter().map(|s| image_path(&s.image)).collect();
    trusted
        .iter()
        .filter(|t| used.contains(t.path.as_str()))
        .cloned()
        .collect()
}

/// Credentials named by a stage, or of a type injected into one of the
/// stages' trusted images.
pub fn credentials_for(
    stages: &[ManifestStage],
    trusted: &[TrustedImageConfig],
    credentials: &[CredentialConfig],
) -> Vec<CredentialConfig> {
    let names: BTreeSet<&str> = stages
        .iter()
        .flat_map(|s| s.credentials.iter().map(String::as_str))
        .collect();
    let injected: BTreeSet<&str> = trusted
        .iter()
        .flat_map(|t| t.injected_credential_types.iter().map(String::as_str))
        .collect();

    credentials
        .iter()
        .filter(|c| names.contains(c.name.as_str()) || injected.contains(c.credential_type.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, image: &str, credentials: &[&str]) -> ManifestStage {
        ManifestStage {
            name: name.to_string(),
            image: image.to_string(),
            credentials: credentials.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn credential(name: &str, credential_type: &str) -> CredentialConfig {
        CredentialConfig {
            name: name.to_string(),
            credential_type: credential_type.to_string(),
            additional_properties: BTreeMap::new(),
        }
    }

    fn trusted(path: &str, injected: &[&str]) -> TrustedImageConfig {
        TrustedImageConfig {
            path: path.to_string(),
            run_privileged: false,
            run_docker: true,
            injected_credential_types: injected.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn test_image_path_strips_tag_and_digest() {
        assert_eq!(image_path("extensions/docker:stable"), "extensions/docker");
        assert_eq!(image_path("extensions/docker@sha256:abc"), "extensions/docker");
        assert_eq!(image_path("localhost:5000/tools/git"), "localhost:5000/tools/git");
        assert_eq!(image_path("golang"), "golang");
    }

    #[test]
    fn test_filters_to_referenced_and_injected_credentials() {
        let stages = vec![
            stage("build", "golang:1.22", &["npm-token"]),
            stage("push", "extensions/docker:stable", &[]),
        ];
        let trusted_all = vec![
            trusted("extensions/docker", &["container-registry"]),
            trusted("extensions/helm", &["kubernetes-engine"]),
        ];
        let credentials_all = vec![
            credential("npm-token", "npm"),
            credential("gcr", "container-registry"),
            credential("prod-cluster", "kubernetes-engine"),
            credential("slack", "slack-webhook"),
        ];

        let trusted = trusted_images_for(&stages, &trusted_all);
        assert_eq!(trusted.len(), 1);
        assert_eq!(trusted[0].path, "extensions/docker");

        let kept: Vec<String> = credentials_for(&stages, &trusted, &credentials_all)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(kept, vec!["npm-token", "gcr"]);
    }
}
