//! Build/release lifecycle and trigger engine for Convoy.
//!
//! - [`CiBuildService`] creates, finishes and cancels builds and releases
//! - the trigger engine starts dependent builds and releases
//! - [`WorkQueue`] runs background work on a bounded set of workers
//! - [`Instrumented`] logs every call into persistence and the job orchestrator

pub mod error;
pub mod instrument;
pub mod queue;
pub mod resources;
pub mod service;
mod triggers;
pub mod version;
mod worker;

#[cfg(test)]
mod testing;

pub use error::{ServiceError, ServiceResult};
pub use instrument::Instrumented;
pub use queue::{QueueError, Task, WorkQueue};
pub use resources::size_resources;
pub use service::{BuildService, CiBuildService};
pub use version::VersionResolver;
