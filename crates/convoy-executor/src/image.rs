//! Executor image resolution with optional digest pinning.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::{ExecResult, ExecutorError};

pub const PULL_ALWAYS: &str = "Always";
pub const PULL_IF_NOT_PRESENT: &str = "IfNotPresent";

const DOCKER_HUB: &str = "registry-1.docker.io";
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub image: String,
    pub pull_policy: &'static str,
}

/// Looks up the content digest of `repository:tag`.
#[async_trait]
pub trait DigestLookup: Send + Sync {
    async fn digest(&self, repository: &str, tag: &str) -> ExecResult<String>;
}

/// Registry v2 HEAD lookup of the manifest digest.
pub struct RegistryDigestLookup {
    client: reqwest::Client,
}

impl RegistryDigestLookup {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for RegistryDigestLookup {
    fn default() -> Self {
        Self::new()
    }
}

/// Split `repository` into registry host and path, defaulting to Docker Hub.
fn registry_and_path(repository: &str) -> (String, String) {
    match repository.split_once('/') {
        Some((host, path)) if host.contains('.') || host.contains(':') || host == "localhost" => {
            (host.to_string(), path.to_string())
        }
        Some(_) => (DOCKER_HUB.to_string(), repository.to_string()),
        None => (DOCKER_HUB.to_string(), format!("library/{repository}")),
    }
}

#[async_trait]
impl DigestLookup for RegistryDigestLookup {
    async fn digest(&self, repository: &str, tag: &str) -> ExecResult<String> {
        let (host, path) = registry_and_path(repository);
        let url = format!("https://{host}/v2/{path}/manifests/{tag}");

        let response = self
            .client
            .head(&url)
            .header("Accept", MANIFEST_ACCEPT)
            .header("User-Agent", "Convoy-CI")
            .send()
            .await?
            .error_for_status()?;

        response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| ExecutorError::Registry(format!("no digest header for {repository}:{tag}")))
    }
}

/// Picks the executor image for a track, pinning it to a cached digest when
/// enabled. Lookup failures fall back to the mutable tag.
pub struct ImageResolver {
    lookup: Arc<dyn DigestLookup>,
    ttl: Duration,
    cache: Mutex<HashMap<String, (String, Instant)>>,
}

impl ImageResolver {
    pub fn new(lookup: Arc<dyn DigestLookup>, ttl: Duration) -> Self {
        Self {
            lookup,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, repository: &str, track: &str, pin_digest: bool) -> ResolvedImage {
        let tagged = ResolvedImage {
            image: format!("{repository}:{track}"),
            pull_policy: PULL_ALWAYS,
        };
        if !pin_digest {
            return tagged;
        }

        let key = tagged.image.clone();
        if let Some(digest) = self.cached(&key) {
            return pinned(repository, &digest);
        }

        match self.lookup.digest(repository, track).await {
            Ok(digest) => {
                debug!(image = %key, digest = %digest, "Pinned executor image");
                self.cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(key, (digest.clone(), Instant::now()));
                pinned(repository, &digest)
            }
            Err(e) => {
                warn!(image = %key, error = %e, "Digest lookup failed, using mutable tag");
                tagged
            }
        }
    }

    fn cached(&self, key: &str) -> Option<String> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(key)
            .filter(|(_, fetched)| fetched.elapsed() < self.ttl)
            .map(|(digest, _)| digest.clone())
    }
}

fn pinned(repository: &str, digest: &str) -> ResolvedImage {
    ResolvedImage {
        image: format!("{repository}@{digest}"),
        pull_policy: PULL_IF_NOT_PRESENT,
    }
}
