//! Task worker with retry and dead-letter handling.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::{TaskQueue, TaskQueueError};
use super::types::{Task, TaskResult, TaskStatus};

/// Runs claimed tasks.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> TaskResult;
}

#[derive(Debug, Clone)]
pub struct TaskWorkerConfig {
    /// Upper bound on idle time between polls; enqueuers can wake the worker earlier.
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for TaskWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            name: "transition-worker".to_string(),
        }
    }
}

impl TaskWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_retried: u64,
    pub tasks_dead_lettered: u64,
    pub uptime_secs: u64,
}

/// What happened to one claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Retrying,
    DeadLettered,
}

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct TaskWorkerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl TaskWorkerHandle {
    /// Stop after the task in flight, if any, finishes.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }

    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }
}

fn lock_stats(stats: &Mutex<WorkerStats>) -> std::sync::MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Polls a [`TaskQueue`] and runs each task through one [`TaskHandler`].
pub struct TaskWorker {
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    config: TaskWorkerConfig,
    wake: Arc<Notify>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl TaskWorker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn TaskHandler>,
        config: TaskWorkerConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
            wake: Arc::new(Notify::new()),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    /// Share a wake-up signal with whoever enqueues tasks.
    pub fn with_waker(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }

    /// Claim and run one task. `None` when nothing is ready.
    pub async fn run_once(&self) -> Result<Option<TaskOutcome>, TaskQueueError> {
        let Some(task) = self.queue.claim_next().await? else {
            return Ok(None);
        };
        debug!(
            worker = %self.config.name,
            task_id = %task.id,
            kind = task.kind.as_str(),
            attempt = task.attempt,
            "claimed task"
        );
        let outcome = self.execute(task).await?;

        let mut stats = lock_stats(&self.stats);
        stats.tasks_processed += 1;
        match outcome {
            TaskOutcome::Completed => stats.tasks_succeeded += 1,
            TaskOutcome::Retrying => stats.tasks_retried += 1,
            TaskOutcome::DeadLettered => stats.tasks_dead_lettered += 1,
        }
        Ok(Some(outcome))
    }

    /// Run tasks until none is ready. Tasks waiting out a backoff are left alone.
    pub async fn drain(&self) -> Result<usize, TaskQueueError> {
        let mut ran = 0;
        while self.run_once().await?.is_some() {
            ran += 1;
        }
        Ok(ran)
    }

    async fn execute(&self, mut task: Task) -> Result<TaskOutcome, TaskQueueError> {
        match self.handler.handle(&task).await {
            TaskResult::Success => {
                task.mark_completed();
                self.queue.update(&task).await?;
                debug!(task_id = %task.id, "task completed");
                Ok(TaskOutcome::Completed)
            }
            TaskResult::Retry(reason) => {
                task.mark_failed(reason.clone());
                if matches!(task.status, TaskStatus::DeadLettered { .. }) {
                    error!(
                        task_id = %task.id,
                        attempts = task.attempt,
                        reason = %reason,
                        payload = %task.payload,
                        "task exhausted retries; dead-lettered for manual reconciliation"
                    );
                    self.queue.dead_letter(task, reason).await?;
                    return Ok(TaskOutcome::DeadLettered);
                }
                warn!(
                    task_id = %task.id,
                    attempt = task.attempt,
                    retry_at = %task.scheduled_at,
                    reason = %reason,
                    "task failed; will retry"
                );
                self.queue.update(&task).await?;
                Ok(TaskOutcome::Retrying)
            }
            TaskResult::Permanent(reason) => {
                error!(
                    task_id = %task.id,
                    reason = %reason,
                    payload = %task.payload,
                    "task failed permanently; dead-lettered"
                );
                task.mark_dead_lettered(reason.clone());
                self.queue.dead_letter(task, reason).await?;
                Ok(TaskOutcome::DeadLettered)
            }
        }
    }

    /// Run the poll loop on the tokio runtime.
    pub fn spawn(self) -> TaskWorkerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let stats = self.stats.clone();
        let join = tokio::spawn(self.run(shutdown_rx));
        TaskWorkerHandle {
            shutdown: Some(shutdown_tx),
            join,
            stats,
        }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        info!(worker = %self.config.name, "task worker started");
        let started = Instant::now();

        loop {
            lock_stats(&self.stats).uptime_secs = started.elapsed().as_secs();

            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(worker = %self.config.name, error = %e, "failed to run task");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            } else if shutdown.try_recv().is_ok() {
                break;
            }
        }

        info!(worker = %self.config.name, "task worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::queue::InMemoryTaskQueue;
    use crate::tasks::types::{RetryPolicy, TaskKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        permanent: bool,
    }

    #[async_trait::async_trait]
    impl TaskHandler for Flaky {
        async fn handle(&self, _task: &Task) -> TaskResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                if self.permanent {
                    TaskResult::Permanent("bad payload".into())
                } else {
                    TaskResult::Retry(format!("attempt {n} failed"))
                }
            } else {
                TaskResult::Success
            }
        }
    }

    fn worker(queue: Arc<InMemoryTaskQueue>, failures: u32, permanent: bool) -> TaskWorker {
        TaskWorker::new(
            queue,
            Arc::new(Flaky {
                failures,
                calls: AtomicU32::new(0),
                permanent,
            }),
            TaskWorkerConfig::default(),
        )
    }

    fn immediate_retries(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(max_attempts, Duration::ZERO)
    }

    #[tokio::test]
    async fn retries_until_success() {
        let queue = InMemoryTaskQueue::arc();
        let task = Task::new(TaskKind::ApplyTransition, serde_json::json!({}))
            .with_retry_policy(immediate_retries(5));
        let id = queue.enqueue(task).await.unwrap();
        let w = worker(queue.clone(), 2, false);

        assert_eq!(w.run_once().await.unwrap(), Some(TaskOutcome::Retrying));
        assert_eq!(w.run_once().await.unwrap(), Some(TaskOutcome::Retrying));
        assert_eq!(w.run_once().await.unwrap(), Some(TaskOutcome::Completed));
        assert_eq!(w.run_once().await.unwrap(), None);

        let done = queue.get(id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.attempt, 3);
        assert_eq!(w.stats().tasks_retried, 2);
    }

    #[tokio::test]
    async fn exhausted_tasks_are_dead_lettered() {
        let queue = InMemoryTaskQueue::arc();
        let task = Task::new(TaskKind::ApplyTransition, serde_json::json!({}))
            .with_retry_policy(immediate_retries(2));
        queue.enqueue(task).await.unwrap();
        let w = worker(queue.clone(), 10, false);

        assert_eq!(w.drain().await.unwrap(), 2);
        let dead = queue.list_dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(w.stats().tasks_dead_lettered, 1);
    }

    #[tokio::test]
    async fn permanent_failures_skip_retries() {
        let queue = InMemoryTaskQueue::arc();
        let task = Task::new(TaskKind::ApplyTransition, serde_json::json!({}))
            .with_retry_policy(immediate_retries(5));
        queue.enqueue(task).await.unwrap();
        let w = worker(queue.clone(), 1, true);

        assert_eq!(w.run_once().await.unwrap(), Some(TaskOutcome::DeadLettered));
        assert_eq!(queue.list_dead_letters(10).await.unwrap()[0].reason, "bad payload");
    }

    #[tokio::test]
    async fn spawned_worker_wakes_on_notify_and_shuts_down() {
        let queue = InMemoryTaskQueue::arc();
        let handler = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
            permanent: false,
        });
        // Long poll interval: only the wake-up can get the task picked up in time.
        let config = TaskWorkerConfig::default().with_poll_interval(Duration::from_secs(3600));
        let w = TaskWorker::new(queue.clone(), handler, config);
        let wake = w.waker();
        let handle = w.spawn();

        let id = queue
            .enqueue(Task::new(TaskKind::ApplyTransition, serde_json::json!({})))
            .await
            .unwrap();
        wake.notify_one();

        let mut completed = false;
        for _ in 0..200 {
            if queue.get(id).await.unwrap().unwrap().status == TaskStatus::Completed {
                completed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(completed);
        handle.shutdown().await;
    }
}
