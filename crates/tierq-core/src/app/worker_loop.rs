//! Worker loop: the caller side of the handler.
//!
//! A worker asks for the next task, runs it, and reports the result. Empty
//! and unavailable results are not errors here; the loop just waits a bit
//! (longer when the broker is in trouble) and asks again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::{PriorityTier, Task, TaskId};
use crate::queue::{Dequeued, PriorityQueueHandler, RequeueOutcome};

/// Runs one task. An `Err` carries the failure text that ends up in the
/// retry or dead-letter record.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Tiers this worker accepts.
    pub tiers: Vec<PriorityTier>,
    /// Wait after an empty poll.
    pub idle_interval: Duration,
    /// Wait after a poll that hit broker errors.
    pub unavailable_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            tiers: PriorityTier::ALL.to_vec(),
            idle_interval: Duration::from_millis(200),
            unavailable_interval: Duration::from_secs(2),
        }
    }
}

/// What one poll did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Completed(TaskId),
    Retried(TaskId),
    DeadLettered(TaskId),
    /// The task ran but its result could not be recorded.
    ReportFailed(TaskId),
    Idle,
    Unavailable,
}

pub struct WorkerLoop {
    id: usize,
    handler: Arc<PriorityQueueHandler>,
    executor: Arc<dyn TaskExecutor>,
    settings: WorkerSettings,
}

impl WorkerLoop {
    pub fn new(
        id: usize,
        handler: Arc<PriorityQueueHandler>,
        executor: Arc<dyn TaskExecutor>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id,
            handler,
            executor,
            settings,
        }
    }

    /// Poll once and handle whatever came back.
    pub async fn run_once(&self) -> Step {
        let dispatched = match self.handler.get_next_task(&self.settings.tiers).await {
            Dequeued::Ready(dispatched) => dispatched,
            Dequeued::Empty => return Step::Idle,
            Dequeued::Unavailable(errors) => {
                tracing::warn!(worker = self.id, errors = errors.len(), "broker unavailable");
                return Step::Unavailable;
            }
        };
        let task_id = dispatched.task_id();

        // no cancellation once started; shutdown waits for this to return
        match self.executor.execute(&dispatched.task).await {
            Ok(()) => match self.handler.complete_task(&dispatched).await {
                Ok(()) => Step::Completed(task_id),
                Err(_) => Step::ReportFailed(task_id),
            },
            Err(failure) => {
                tracing::info!(worker = self.id, %task_id, tier = %dispatched.tier, %failure, "task failed");
                let job = dispatched.job.failed_with(failure);
                let policy = &self.handler.config().retry_policy;
                match self.handler.requeue_failed_task(job, policy).await {
                    RequeueOutcome::Retried { .. } => Step::Retried(task_id),
                    RequeueOutcome::DeadLettered => Step::DeadLettered(task_id),
                    RequeueOutcome::Failed(_) => Step::ReportFailed(task_id),
                }
            }
        }
    }

    /// Poll until shutdown is requested.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::debug!(worker = self.id, tiers = ?self.settings.tiers, "worker started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let wait = match self.run_once().await {
                Step::Idle => self.settings.idle_interval,
                Step::Unavailable => self.settings.unavailable_interval,
                _ => continue,
            };

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::debug!(worker = self.id, "worker stopped");
    }
}

/// Worker group handle.
/// - `request_shutdown` stops every worker after its current task
/// - `shutdown_and_join` also waits for them
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers sharing one handler and executor.
    pub fn spawn(
        n: usize,
        handler: Arc<PriorityQueueHandler>,
        executor: Arc<dyn TaskExecutor>,
        settings: WorkerSettings,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let worker = WorkerLoop::new(
                worker_id,
                Arc::clone(&handler),
                Arc::clone(&executor),
                settings.clone(),
            );
            joins.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }

        Self { shutdown_tx, joins }
    }

    /// Receiver that fires when the group is shut down, for companion
    /// loops such as the retry sweeper.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                tracing::error!(error = %err, "worker task panicked");
            }
        }
    }
}
