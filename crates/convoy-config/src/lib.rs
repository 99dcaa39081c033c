//! KDL configuration parsing for Convoy.
//!
//! This crate handles parsing of:
//! - Pipeline manifests (`.convoy.kdl`)
//! - Server configuration, held as an immutable snapshot

pub mod error;
pub mod manifest;
mod nodes;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use manifest::parse_manifest;
pub use system::{
    CiServerConfig, ConfigHandle, CredentialConfig, DockerNetworkConfig, GitProviderConfig,
    JobTokenConfig, JobsConfig, ResourceBounds, ServerConfig, TrustedImageConfig, WorkQueueConfig,
    load_server_config, parse_server_config,
};
