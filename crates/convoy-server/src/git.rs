//! Git providers backed by statically configured tokens.

use async_trait::async_trait;
use convoy_config::GitProviderConfig;
use convoy_core::Result;
use convoy_core::git::{GitJobVars, GitJobVarsProvider, GitProviderResolver};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Environment variable exposing the clone token to stages.
pub const GIT_TOKEN_ENV: &str = "CONVOY_GIT_API_TOKEN";

pub struct StaticTokenProvider {
    source: String,
    token: String,
}

impl StaticTokenProvider {
    pub fn new(source: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl GitJobVarsProvider for StaticTokenProvider {
    async fn job_vars(&self, owner: &str, name: &str) -> Result<GitJobVars> {
        Ok(GitJobVars {
            token: self.token.clone(),
            clone_url: format!(
                "https://x-access-token:{}@{}/{owner}/{name}",
                self.token, self.source
            ),
            env_vars: BTreeMap::from([(GIT_TOKEN_ENV.to_string(), self.token.clone())]),
        })
    }
}

/// Register one provider per configured git host.
pub fn resolver_from_config(providers: &[GitProviderConfig]) -> GitProviderResolver {
    providers
        .iter()
        .fold(GitProviderResolver::new(), |resolver, p| {
            resolver.with_provider(
                p.source.clone(),
                Arc::new(StaticTokenProvider::new(&p.source, &p.token)),
            )
        })
}
