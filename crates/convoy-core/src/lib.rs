//! Core domain types and traits for the Convoy CI/CD control core.
//!
//! This crate contains:
//! - Pipeline identity and the latest-known pipeline state
//! - Builds, releases, statuses and job resources
//! - The parsed manifest: stages, release targets, version template
//! - Trigger definitions and their filter predicates
//! - Collaborator traits (executor jobs, secret codec, git providers)

pub mod build;
pub mod error;
pub mod executor;
pub mod git;
pub mod manifest;
pub mod pipeline;
pub mod secret;
pub mod trigger;

pub use build::{
    Build, BuildLog, Commit, JobResources, LogStep, Release, ResourceUtilization, Status,
};
pub use error::{Error, Result};
pub use pipeline::{Pipeline, PipelineIdentity};
