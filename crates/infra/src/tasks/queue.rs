//! Task queue abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use super::types::{DeadLetterEntry, Task, TaskId, TaskStatus};
use crate::db::DbError;

#[async_trait::async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<TaskId, TaskQueueError>;

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskQueueError>;

    /// Claim the oldest ready task, marking it running.
    async fn claim_next(&self) -> Result<Option<Task>, TaskQueueError>;

    async fn update(&self, task: &Task) -> Result<(), TaskQueueError>;

    async fn dead_letter(&self, task: Task, reason: String) -> Result<(), TaskQueueError>;

    async fn list_dead_letters(&self, limit: usize)
    -> Result<Vec<DeadLetterEntry>, TaskQueueError>;

    /// Move a dead-lettered task back to pending.
    async fn retry_dead_letter(&self, task_id: TaskId) -> Result<Task, TaskQueueError>;

    async fn stats(&self) -> Result<QueueStats, TaskQueueError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskQueueError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error("task queue storage error: {0}")]
    Storage(String),
}

impl From<DbError> for TaskQueueError {
    fn from(err: DbError) -> Self {
        TaskQueueError::Storage(err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// In-memory task queue for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    tasks: RwLock<HashMap<TaskId, Task>>,
    dead_letters: RwLock<HashMap<TaskId, DeadLetterEntry>>,
}

fn poisoned<T>(_: T) -> TaskQueueError {
    TaskQueueError::Storage("task queue lock poisoned".to_string())
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait::async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<TaskId, TaskQueueError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        if tasks.contains_key(&task.id) {
            return Err(TaskQueueError::AlreadyExists(task.id));
        }
        let id = task.id;
        tasks.insert(id, task);
        Ok(id)
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskQueueError> {
        Ok(self.tasks.read().map_err(poisoned)?.get(&task_id).cloned())
    }

    async fn claim_next(&self) -> Result<Option<Task>, TaskQueueError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let now = Utc::now();

        let next = tasks
            .values()
            .filter(|t| t.is_ready_at(now))
            .min_by_key(|t| (t.scheduled_at, t.created_at, t.id.0))
            .map(|t| t.id);

        Ok(next.and_then(|id| {
            let task = tasks.get_mut(&id)?;
            task.mark_running();
            Some(task.clone())
        }))
    }

    async fn update(&self, task: &Task) -> Result<(), TaskQueueError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        match tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(TaskQueueError::NotFound(task.id)),
        }
    }

    async fn dead_letter(&self, mut task: Task, reason: String) -> Result<(), TaskQueueError> {
        if !matches!(task.status, TaskStatus::DeadLettered { .. }) {
            task.mark_dead_lettered(reason.clone());
        }
        self.tasks
            .write()
            .map_err(poisoned)?
            .insert(task.id, task.clone());
        self.dead_letters
            .write()
            .map_err(poisoned)?
            .insert(task.id, DeadLetterEntry::new(task, reason));
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, TaskQueueError> {
        let mut entries: Vec<_> = self
            .dead_letters
            .read()
            .map_err(poisoned)?
            .values()
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.dead_lettered_at.cmp(&a.dead_lettered_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn retry_dead_letter(&self, task_id: TaskId) -> Result<Task, TaskQueueError> {
        let entry = self
            .dead_letters
            .write()
            .map_err(poisoned)?
            .remove(&task_id)
            .ok_or(TaskQueueError::NotFound(task_id))?;
        let mut task = entry.task;
        task.reset_for_retry();
        self.tasks
            .write()
            .map_err(poisoned)?
            .insert(task.id, task.clone());
        Ok(task)
    }

    async fn stats(&self) -> Result<QueueStats, TaskQueueError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        let mut stats = QueueStats::default();
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed { .. } => stats.failed += 1,
                TaskStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }
}
