//! Executor job orchestration for Convoy.
//!
//! Builds and releases run as Kubernetes jobs. Each job is paired with a
//! config map holding the builder configuration and a secret holding the
//! job-specific decryption key, all three sharing the job's name.

pub mod builder_config;
pub mod ci_builder;
pub mod cluster;
pub mod error;
pub mod image;
pub mod job_spec;
pub mod kubernetes;
pub mod naming;
pub mod token;

pub use ci_builder::{CiBuilderJobClient, WATCH_TIMEOUT};
pub use cluster::{ClusterApi, JobPhase, PodInfo, PodPhase};
pub use error::{ExecResult, ExecutorError};
pub use image::{DigestLookup, ImageResolver, RegistryDigestLookup, ResolvedImage};
pub use kubernetes::KubeClusterApi;
pub use naming::{MAX_JOB_NAME_LEN, job_name};
pub use token::JobTokenSigner;
