//! Worker that processes tasks from the work queue.

use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info};

use crate::queue::{Shared, Task};

/// A worker that pulls tasks off the shared receiver until it closes.
pub(crate) struct Worker {
    id: String,
    receiver: Arc<Mutex<mpsc::Receiver<Task>>>,
    shared: Arc<Shared>,
}

impl Worker {
    pub(crate) fn new(id: impl Into<String>, receiver: Arc<Mutex<mpsc::Receiver<Task>>>, shared: Arc<Shared>) -> Self {
        Self {
            id: id.into(),
            receiver,
            shared,
        }
    }

    /// Run the worker loop.
    pub(crate) async fn run(&self) {
        debug!(worker_id = %self.id, "Starting worker");

        loop {
            // Hold the lock only while waiting for the next task.
            let next = self.receiver.lock().await.recv().await;
            let Some(task) = next else {
                break;
            };

            debug!(worker_id = %self.id, task = %task.name, "Running task");
            // A panicking task must not take the worker down with it.
            if let Err(e) = tokio::spawn(task.work).await {
                error!(worker_id = %self.id, task = %task.name, error = %e, "Task panicked");
            }
            self.shared.finished();
        }

        info!(worker_id = %self.id, "Worker stopped");
    }
}
