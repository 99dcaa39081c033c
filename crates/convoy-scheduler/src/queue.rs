//! Bounded in-process work queue for background units of work.
//!
//! Trigger dispatch and fire-and-forget job creation go through here instead
//! of detached spawns, so back-pressure is visible and shutdown can drain
//! outstanding work.

use convoy_config::WorkQueueConfig;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::worker::Worker;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("work queue is full")]
    Full,

    #[error("work queue is shut down")]
    Closed,
}

/// A named unit of work.
pub struct Task {
    pub name: String,
    pub work: BoxFuture<'static, ()>,
}

pub(crate) struct Shared {
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Shared {
    pub(crate) fn finished(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Cloneable handle to the queue and its workers.
#[derive(Clone)]
pub struct WorkQueue {
    sender: Arc<Mutex<Option<mpsc::Sender<Task>>>>,
    shared: Arc<Shared>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WorkQueue {
    /// Create the queue and spawn its workers on the current runtime.
    pub fn start(config: WorkQueueConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shared = Arc::new(Shared {
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let workers = (0..config.workers.max(1))
            .map(|i| {
                let worker = Worker::new(format!("worker-{i}"), receiver.clone(), shared.clone());
                tokio::spawn(async move { worker.run().await })
            })
            .collect();

        info!(capacity = config.capacity, workers = config.workers, "Started work queue");

        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            shared,
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Task>, QueueError> {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(QueueError::Closed)
    }

    fn task<F>(name: impl Into<String>, work: F) -> Task
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Task {
            name: name.into(),
            work: Box::pin(work),
        }
    }

    /// Enqueue, waiting for capacity.
    pub async fn submit<F>(&self, name: impl Into<String>, work: F) -> Result<(), QueueError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.sender()?;
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        if sender.send(Self::task(name, work)).await.is_err() {
            self.shared.finished();
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Enqueue without waiting; fails with [`QueueError::Full`] at capacity.
    pub fn try_submit<F>(&self, name: impl Into<String>, work: F) -> Result<(), QueueError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.try_enqueue(Self::task(name, work)).map_err(|(err, _)| err)
    }

    fn try_enqueue(&self, task: Task) -> Result<(), (QueueError, Task)> {
        let sender = match self.sender() {
            Ok(sender) => sender,
            Err(err) => return Err((err, task)),
        };
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        sender.try_send(task).map_err(|err| {
            self.shared.finished();
            match err {
                mpsc::error::TrySendError::Full(task) => (QueueError::Full, task),
                mpsc::error::TrySendError::Closed(task) => (QueueError::Closed, task),
            }
        })
    }

    /// Enqueue, or run the work on the caller when the queue is full or shut
    /// down. Used from work that already runs on a worker, where waiting for
    /// capacity could starve the queue.
    pub async fn submit_or_run<F>(&self, name: impl Into<String>, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Err((err, task)) = self.try_enqueue(Self::task(name, work)) {
            warn!(task = %task.name, error = %err, "Running task inline");
            task.work.await;
        }
    }

    /// Number of submitted tasks not yet finished.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every submitted task has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work, let workers drain what is queued, and wait for
    /// them to exit.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(sender);

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        debug!(workers = workers.len(), "Draining work queue");
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker ended abnormally");
            }
        }
        info!("Work queue drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn config(capacity: usize, workers: usize) -> WorkQueueConfig {
        WorkQueueConfig { capacity, workers }
    }

    #[tokio::test]
    async fn test_runs_submitted_work() {
        let queue = WorkQueue::start(config(8, 2));
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let counter = counter.clone();
            queue
                .submit(format!("task-{i}"), async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }

        queue.wait_idle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_try_submit_reports_full() {
        let queue = WorkQueue::start(config(1, 1));
        let gate = Arc::new(Notify::new());

        // Occupies the single worker.
        let blocker = gate.clone();
        queue
            .submit("blocker", async move { blocker.notified().await })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Fills the single slot.
        queue.try_submit("queued", async {}).unwrap();
        assert_eq!(queue.try_submit("overflow", async {}), Err(QueueError::Full));

        gate.notify_one();
        queue.wait_idle().await;
    }

    #[tokio::test]
    async fn test_submit_or_run_runs_inline_when_full() {
        let queue = WorkQueue::start(config(1, 1));
        let gate = Arc::new(Notify::new());

        let blocker = gate.clone();
        queue
            .submit("blocker", async move { blocker.notified().await })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.try_submit("queued", async {}).unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        queue
            .submit_or_run("inline", async move { flag.store(true, Ordering::SeqCst) })
            .await;
        assert!(ran.load(Ordering::SeqCst));

        gate.notify_one();
        queue.wait_idle().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects() {
        let queue = WorkQueue::start(config(16, 2));
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..10 {
            let counter = counter.clone();
            queue
                .submit(format!("task-{i}"), async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }

        queue.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(queue.submit("late", async {}).await, Err(QueueError::Closed));
    }
}
