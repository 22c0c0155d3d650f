//! Deferred work execution.
//!
//! The [`TaskRunner`] accepts units of work from any thread and runs them on
//! a fixed pool of worker tasks. The [`ExecutionContext`] that is ambient at
//! schedule time travels with the unit and is restored around its execution,
//! so work can read configuration and use the pool exactly as if it ran
//! inline. A unit that fails or panics is logged and counted; the worker
//! that ran it keeps serving the queue.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::ExecutionContext;

/// A unit of deferred work.
pub type TaskUnit = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Identifier assigned to each scheduled unit.
pub type TaskId = Uuid;

/// Task runner errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The runner was asked to start without workers.
    #[error("Task runner requires at least one worker")]
    NoWorkers,

    /// The runner has been shut down.
    #[error("Task runner is closed")]
    Closed,
}

/// A unit paired with the context it was scheduled under.
pub struct QueuedTask {
    id: TaskId,
    context: ExecutionContext,
    scheduled_at: Instant,
    unit: TaskUnit,
}

impl QueuedTask {
    /// The task identifier.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The captured context.
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Time spent in the queue so far.
    pub fn queued_for(&self) -> Duration {
        self.scheduled_at.elapsed()
    }
}

impl fmt::Debug for QueuedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedTask")
            .field("id", &self.id)
            .field("request_id", &self.context.request_id())
            .finish_non_exhaustive()
    }
}

/// Counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    /// Units accepted by [`TaskRunner::schedule`].
    pub scheduled: u64,
    /// Units that returned `Ok`.
    pub succeeded: u64,
    /// Units that returned `Err` or panicked.
    pub failed: u64,
    /// Number of workers.
    pub workers: usize,
}

impl TaskStats {
    /// Units accepted but not yet finished.
    pub fn pending(&self) -> u64 {
        self.scheduled
            .saturating_sub(self.succeeded)
            .saturating_sub(self.failed)
    }
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Worker pool for deferred units.
///
/// Cloning is cheap and every clone feeds the same queue.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    base: ExecutionContext,
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    counters: Arc<Counters>,
}

impl TaskRunner {
    /// Start `workers` worker tasks on the current runtime.
    ///
    /// `base` is the context captured for units scheduled outside any
    /// request scope.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NoWorkers`] if `workers` is zero.
    pub fn start(base: ExecutionContext, workers: usize) -> Result<Self, TaskError> {
        if workers == 0 {
            return Err(TaskError::NoWorkers);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let handles: Vec<_> = (0..workers)
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                let counters = Arc::clone(&counters);
                tokio::spawn(worker_loop(index, receiver, counters))
            })
            .collect();

        info!(workers, "Task runner started");
        Ok(Self {
            inner: Arc::new(RunnerInner {
                base,
                sender: Mutex::new(Some(sender)),
                workers: Mutex::new(handles),
                worker_count: workers,
                counters,
            }),
        })
    }

    /// Queue `unit` under the ambient context, or the base context when
    /// called outside any scope.
    pub fn schedule<F, Fut>(&self, unit: F) -> Result<TaskId, TaskError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let context = ExecutionContext::capture_or(&self.inner.base);
        self.schedule_with(context, unit)
    }

    /// Queue `unit` under an explicit context.
    pub fn schedule_with<F, Fut>(
        &self,
        context: ExecutionContext,
        unit: F,
    ) -> Result<TaskId, TaskError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let task = QueuedTask {
            id: Uuid::new_v4(),
            context,
            scheduled_at: Instant::now(),
            unit: Box::new(move || Box::pin(unit())),
        };
        let id = task.id;

        let sender = self.inner.sender.lock();
        let sender = sender.as_ref().ok_or(TaskError::Closed)?;
        sender.send(task).map_err(|_| TaskError::Closed)?;

        self.inner.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        debug!(task_id = %id, "Task scheduled");
        Ok(id)
    }

    /// The context used when scheduling outside a scope.
    pub fn base_context(&self) -> &ExecutionContext {
        &self.inner.base
    }

    /// Current counters.
    pub fn stats(&self) -> TaskStats {
        let counters = &self.inner.counters;
        TaskStats {
            scheduled: counters.scheduled.load(Ordering::Relaxed),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            workers: self.inner.worker_count,
        }
    }

    /// Whether new units are still accepted.
    pub fn is_open(&self) -> bool {
        self.inner.sender.lock().is_some()
    }

    /// Stop accepting work, drain the queue and wait for the workers.
    ///
    /// Calling this more than once is harmless.
    pub async fn shutdown(&self) {
        let Some(sender) = self.inner.sender.lock().take() else {
            return;
        };
        drop(sender);

        let handles = std::mem::take(&mut *self.inner.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Task worker terminated abnormally");
            }
        }

        let stats = self.stats();
        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            "Task runner stopped"
        );
    }
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

async fn worker_loop(
    index: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedTask>>>,
    counters: Arc<Counters>,
) {
    debug!(worker = index, "Task worker started");

    loop {
        let next = receiver.lock().await.recv().await;
        let Some(task) = next else { break };

        let waited = task.queued_for();
        let QueuedTask {
            id, context, unit, ..
        } = task;
        let request_id = context.request_id().map(str::to_owned);
        debug!(
            worker = index,
            task_id = %id,
            queued_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            "Task started"
        );

        // Spawned so a panic unwinds the unit's task, not the worker.
        let outcome = tokio::spawn(context.scope(async move { unit().await })).await;

        match outcome {
            Ok(Ok(())) => {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(worker = index, task_id = %id, "Task completed");
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker = index,
                    task_id = %id,
                    request_id = request_id.as_deref().unwrap_or("-"),
                    error = %e,
                    "Task failed"
                );
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker = index,
                    task_id = %id,
                    request_id = request_id.as_deref().unwrap_or("-"),
                    error = %e,
                    "Task panicked"
                );
            }
        }
    }

    debug!(worker = index, "Task worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::Instrumentation;
    use crate::persistence::PersistenceGateway;
    use liftoff_common::{ConfigStore, Profile};
    use tokio::sync::oneshot;

    async fn base_context() -> ExecutionContext {
        let config = ConfigStore::for_profile(Profile::Test).unwrap();
        let db = PersistenceGateway::connect(&config.settings().database, Instrumentation::new())
            .await
            .unwrap();
        ExecutionContext::new(Arc::new(config), db)
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let err = TaskRunner::start(base_context().await, 0).unwrap_err();
        assert_eq!(err, TaskError::NoWorkers);
    }

    #[tokio::test]
    async fn test_unit_sees_captured_context() {
        let base = base_context().await;
        let runner = TaskRunner::start(base.clone(), 2).unwrap();
        let (tx, rx) = oneshot::channel();

        let request = base.with_request_id("req-42");
        request
            .scope(async {
                runner
                    .schedule(move || async move {
                        let seen = ExecutionContext::current()
                            .and_then(|c| c.request_id().map(str::to_owned));
                        let _ = tx.send(seen);
                        Ok(())
                    })
                    .unwrap();
            })
            .await;

        assert_eq!(rx.await.unwrap().as_deref(), Some("req-42"));
        runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_unscoped_schedule_uses_base() {
        let base = base_context().await;
        let runner = TaskRunner::start(base, 1).unwrap();
        let (tx, rx) = oneshot::channel();

        runner
            .schedule(move || async move {
                let ctx = ExecutionContext::current();
                let _ = tx.send(ctx.map(|c| c.request_id().is_none()));
                Ok(())
            })
            .unwrap();

        assert_eq!(rx.await.unwrap(), Some(true));
        runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_are_counted_and_worker_survives() {
        let runner = TaskRunner::start(base_context().await, 1).unwrap();

        runner
            .schedule(|| async { anyhow::bail!("boom") })
            .unwrap();
        runner
            .schedule(|| async { panic!("unit panicked") })
            .unwrap();
        runner.schedule(|| async { Ok(()) }).unwrap();

        runner.shutdown().await;

        let stats = runner.stats();
        assert_eq!(stats.scheduled, 3);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.pending(), 0);
    }

    #[tokio::test]
    async fn test_schedule_after_shutdown() {
        let runner = TaskRunner::start(base_context().await, 1).unwrap();
        runner.shutdown().await;
        runner.shutdown().await;

        assert!(!runner.is_open());
        let err = runner.schedule(|| async { Ok(()) }).unwrap_err();
        assert_eq!(err, TaskError::Closed);
    }
}
