//! Postgres-backed task queue over `transition_tasks`.
//!
//! Dead letters stay in the same table with `status = 'dead_lettered'`.
//! A task left `running` longer than the lease (crashed worker) becomes
//! claimable again.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgRow;
use tracing::instrument;
use uuid::Uuid;

use super::queue::{QueueStats, TaskQueue, TaskQueueError};
use super::types::{DeadLetterEntry, RetryPolicy, Task, TaskId, TaskKind, TaskStatus};
use crate::db::{col, map_sqlx_error};

const COLUMNS: &str = "id, kind, payload, status, attempt, retry_policy, last_error, \
     scheduled_at, created_at, updated_at, dead_lettered_at, dead_letter_reason";

#[derive(Debug, Clone)]
pub struct PostgresTaskQueue {
    pool: Arc<PgPool>,
    lease: Duration,
}

impl PostgresTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            lease: Duration::minutes(5),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

#[async_trait::async_trait]
impl TaskQueue for PostgresTaskQueue {
    #[instrument(skip(self, task), fields(task_id = %task.id, kind = task.kind.as_str()), err)]
    async fn enqueue(&self, task: Task) -> Result<TaskId, TaskQueueError> {
        let policy = policy_json(&task.retry_policy)?;
        let result = sqlx::query(
            r#"
            INSERT INTO transition_tasks (
                id, kind, payload, status, attempt, retry_policy, last_error,
                scheduled_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(task.id.0)
        .bind(task.kind.as_str())
        .bind(&task.payload)
        .bind(task.status.as_str())
        .bind(task.attempt as i32)
        .bind(policy)
        .bind(task.status.error())
        .bind(task.scheduled_at)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&*self.pool)
        .await;

        match result.map_err(|e| map_sqlx_error("enqueue_task", e)) {
            Ok(_) => Ok(task.id),
            Err(crate::db::DbError::UniqueViolation { .. }) => {
                Err(TaskQueueError::AlreadyExists(task.id))
            }
            Err(other) => Err(other.into()),
        }
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskQueueError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM transition_tasks WHERE id = $1"))
            .bind(task_id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_task", e))?;
        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self) -> Result<Option<Task>, TaskQueueError> {
        let now = Utc::now();
        let stale_before = now - self.lease;
        let row = sqlx::query(&format!(
            r#"
            UPDATE transition_tasks
            SET status = 'running', attempt = attempt + 1, updated_at = $1
            WHERE id = (
                SELECT id FROM transition_tasks
                WHERE (status IN ('pending', 'failed') AND scheduled_at <= $1)
                   OR (status = 'running' AND updated_at < $2)
                ORDER BY scheduled_at, created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_task", e))?;
        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, status = task.status.as_str()), err)]
    async fn update(&self, task: &Task) -> Result<(), TaskQueueError> {
        let result = sqlx::query(
            r#"
            UPDATE transition_tasks
            SET status = $2, attempt = $3, last_error = $4, scheduled_at = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(task.id.0)
        .bind(task.status.as_str())
        .bind(task.attempt as i32)
        .bind(task.status.error())
        .bind(task.scheduled_at)
        .bind(task.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_task", e))?;

        if result.rows_affected() == 0 {
            return Err(TaskQueueError::NotFound(task.id));
        }
        Ok(())
    }

    #[instrument(skip(self, task), fields(task_id = %task.id), err)]
    async fn dead_letter(&self, mut task: Task, reason: String) -> Result<(), TaskQueueError> {
        if !matches!(task.status, TaskStatus::DeadLettered { .. }) {
            task.mark_dead_lettered(reason.clone());
        }
        sqlx::query(
            r#"
            UPDATE transition_tasks
            SET status = 'dead_lettered', attempt = $2, last_error = $3, updated_at = $4,
                dead_lettered_at = $4, dead_letter_reason = $5
            WHERE id = $1
            "#,
        )
        .bind(task.id.0)
        .bind(task.attempt as i32)
        .bind(task.status.error())
        .bind(task.updated_at)
        .bind(&reason)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letter_task", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_dead_letters(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, TaskQueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM transition_tasks WHERE status = 'dead_lettered' \
             ORDER BY dead_lettered_at DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter()
            .map(|row| {
                let task = task_from_row(row)?;
                let dead_lettered_at: Option<DateTime<Utc>> = col(row, "dead_lettered_at")?;
                let reason: Option<String> = col(row, "dead_letter_reason")?;
                Ok::<_, TaskQueueError>(DeadLetterEntry {
                    dead_lettered_at: dead_lettered_at.unwrap_or(task.updated_at),
                    reason: reason.unwrap_or_default(),
                    task,
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn retry_dead_letter(&self, task_id: TaskId) -> Result<Task, TaskQueueError> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            UPDATE transition_tasks
            SET status = 'pending', attempt = 0, last_error = NULL, scheduled_at = $2,
                updated_at = $2, dead_lettered_at = NULL, dead_letter_reason = NULL
            WHERE id = $1 AND status = 'dead_lettered'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(task_id.0)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("retry_dead_letter", e))?
        .ok_or(TaskQueueError::NotFound(task_id))?;
        task_from_row(&row)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<QueueStats, TaskQueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM transition_tasks GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("task_stats", e))?;

        let mut stats = QueueStats::default();
        for row in &rows {
            let status: String = col(row, "status")?;
            let n: i64 = col(row, "n")?;
            let n = usize::try_from(n).unwrap_or(0);
            match status.as_str() {
                "pending" => stats.pending = n,
                "running" => stats.running = n,
                "completed" => stats.completed = n,
                "failed" => stats.failed = n,
                "dead_lettered" => stats.dead_lettered = n,
                _ => {}
            }
        }
        Ok(stats)
    }
}

fn policy_json(policy: &RetryPolicy) -> Result<serde_json::Value, TaskQueueError> {
    serde_json::to_value(policy).map_err(|e| TaskQueueError::Storage(e.to_string()))
}

fn task_from_row(row: &PgRow) -> Result<Task, TaskQueueError> {
    let id: Uuid = col(row, "id")?;
    let kind: String = col(row, "kind")?;
    let status: String = col(row, "status")?;
    let attempt: i32 = col(row, "attempt")?;
    let attempt = u32::try_from(attempt).unwrap_or(0);
    let last_error: Option<String> = col(row, "last_error")?;
    let policy: serde_json::Value = col(row, "retry_policy")?;

    let kind = TaskKind::parse(&kind)
        .ok_or_else(|| TaskQueueError::Storage(format!("unknown task kind: {kind}")))?;
    let error = last_error.unwrap_or_default();
    let status = match status.as_str() {
        "pending" => TaskStatus::Pending,
        "running" => TaskStatus::Running,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed { error, attempt },
        "dead_lettered" => TaskStatus::DeadLettered {
            error,
            attempts: attempt,
        },
        other => {
            return Err(TaskQueueError::Storage(format!("unknown task status: {other}")));
        }
    };

    Ok(Task {
        id: TaskId::from_uuid(id),
        kind,
        payload: col(row, "payload")?,
        status,
        retry_policy: serde_json::from_value(policy)
            .map_err(|e| TaskQueueError::Storage(e.to_string()))?,
        attempt,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
        scheduled_at: col(row, "scheduled_at")?,
    })
}
