use std::sync::Arc;

use tracing::error;

use artforge_predictions::PredictionUpdate;

use crate::tasks::{Task, TaskHandler, TaskResult};

use super::manager::PredictionLifecycle;

/// Runs `ApplyTransition` tasks against the lifecycle.
pub struct TransitionHandler {
    lifecycle: Arc<PredictionLifecycle>,
}

impl TransitionHandler {
    pub fn new(lifecycle: Arc<PredictionLifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait::async_trait]
impl TaskHandler for TransitionHandler {
    async fn handle(&self, task: &Task) -> TaskResult {
        let update: PredictionUpdate = match serde_json::from_value(task.payload.clone()) {
            Ok(update) => update,
            Err(err) => {
                error!(task_id = %task.id, error = %err, "undecodable transition payload");
                return TaskResult::Permanent(format!("undecodable payload: {err}"));
            }
        };

        match self.lifecycle.apply_transition(&update).await {
            Ok(_) => TaskResult::Success,
            Err(err) if err.is_retryable() => TaskResult::Retry(err.to_string()),
            Err(err) => TaskResult::Permanent(err.to_string()),
        }
    }
}
