//! Repository traits and implementations.

pub mod build;
mod rows;

pub use build::{BuildRepo, PgBuildRepo};
