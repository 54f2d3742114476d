use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use artforge_core::{PredictionId, UserId};

use crate::input::ToolInput;
use crate::kind::OperationKind;
use crate::status::{PredictionStatus, Transition, TransitionError};

/// A submitted job, as recorded by the job store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: PredictionId,
    pub user_id: UserId,
    pub kind: OperationKind,
    pub model: String,
    pub status: PredictionStatus,
    pub input: ToolInput,
    pub output: Option<Vec<String>>,
    pub error: Option<String>,
    pub metrics: Option<serde_json::Value>,
    /// Fixed at creation.
    pub points_reserved: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Prediction {
    pub fn starting(
        id: PredictionId,
        user_id: UserId,
        model: impl Into<String>,
        input: ToolInput,
        points_reserved: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            kind: input.kind(),
            model: model.into(),
            status: PredictionStatus::Starting,
            input,
            output: None,
            error: None,
            metrics: None,
            points_reserved,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Apply a provider update under the state machine.
    ///
    /// Only [`Transition::Apply`] writes status, output and error; a
    /// redelivery refreshes `updated_at`; conflicts and stale updates leave the
    /// record untouched.
    pub fn apply_update(
        &mut self,
        update: &PredictionUpdate,
    ) -> Result<Transition, TransitionError> {
        if update.id != self.id {
            return Err(TransitionError::IdMismatch {
                expected: self.id.clone(),
                got: update.id.clone(),
            });
        }

        let transition = self.status.transition_to(update.status);
        match transition {
            Transition::Apply => {
                self.status = update.status;
                match update.status {
                    PredictionStatus::Processing => {
                        self.started_at.get_or_insert(update.at);
                    }
                    PredictionStatus::Succeeded => {
                        self.output = Some(update.output.clone());
                        self.error = None;
                        self.completed_at = Some(update.completed_at.unwrap_or(update.at));
                    }
                    PredictionStatus::Failed | PredictionStatus::Canceled => {
                        self.output = None;
                        self.error = update.error.clone();
                        self.completed_at = Some(update.completed_at.unwrap_or(update.at));
                    }
                    PredictionStatus::Starting => {}
                }
                if update.metrics.is_some() {
                    self.metrics = update.metrics.clone();
                }
                self.updated_at = update.at;
            }
            Transition::Redelivery => {
                self.updated_at = update.at;
            }
            Transition::Conflict | Transition::Stale => {}
        }
        Ok(transition)
    }

    /// Provider-reported run time, falling back to wall-clock timestamps.
    pub fn processing_ms(&self) -> Option<u64> {
        let reported = self
            .metrics
            .as_ref()
            .and_then(|m| m.get("predict_time"))
            .and_then(serde_json::Value::as_f64)
            .filter(|s| s.is_finite() && *s >= 0.0);
        if let Some(secs) = reported {
            return Some((secs * 1000.0).round() as u64);
        }
        let end = self.completed_at?;
        let start = self.started_at.unwrap_or(self.created_at);
        u64::try_from((end - start).num_milliseconds()).ok()
    }
}

/// A status update for one job, derived from a provider webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionUpdate {
    pub id: PredictionId,
    pub status: PredictionStatus,
    pub output: Vec<String>,
    pub error: Option<String>,
    pub metrics: Option<serde_json::Value>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When we observed the update.
    pub at: DateTime<Utc>,
}

impl PredictionUpdate {
    pub fn status_only(id: PredictionId, status: PredictionStatus, at: DateTime<Utc>) -> Self {
        Self {
            id,
            status,
            output: Vec::new(),
            error: None,
            metrics: None,
            completed_at: None,
            at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::OperationKind;
    use chrono::Duration;
    use serde_json::json;

    fn job(now: DateTime<Utc>) -> Prediction {
        let input = ToolInput::parse(
            OperationKind::Edit,
            json!({"image": "https://cdn.example/a.png", "prompt": "sunset"}),
        )
        .unwrap();
        Prediction::starting(
            PredictionId::new("p-1").unwrap(),
            UserId::new(),
            "edit-model",
            input,
            15,
            now,
        )
    }

    #[test]
    fn success_records_output_and_completion() {
        let now = Utc::now();
        let mut p = job(now);
        let mut update =
            PredictionUpdate::status_only(p.id.clone(), PredictionStatus::Succeeded, now);
        update.output = vec!["https://provider/out.png".into()];
        update.metrics = Some(json!({"predict_time": 2.5}));

        assert_eq!(p.apply_update(&update).unwrap(), Transition::Apply);
        assert_eq!(p.status, PredictionStatus::Succeeded);
        assert_eq!(p.output.as_deref(), Some(&["https://provider/out.png".to_string()][..]));
        assert_eq!(p.completed_at, Some(now));
        assert_eq!(p.processing_ms(), Some(2500));
        assert_eq!(p.points_reserved, 15);
    }

    #[test]
    fn conflicting_terminal_is_ignored() {
        let now = Utc::now();
        let mut p = job(now);
        let mut failed = PredictionUpdate::status_only(p.id.clone(), PredictionStatus::Failed, now);
        failed.error = Some("nsfw".into());
        p.apply_update(&failed).unwrap();

        let later = now + Duration::seconds(5);
        let succeeded =
            PredictionUpdate::status_only(p.id.clone(), PredictionStatus::Succeeded, later);
        assert_eq!(p.apply_update(&succeeded).unwrap(), Transition::Conflict);
        assert_eq!(p.status, PredictionStatus::Failed);
        assert_eq!(p.error.as_deref(), Some("nsfw"));
        assert_eq!(p.updated_at, now);

        let again = PredictionUpdate::status_only(p.id.clone(), PredictionStatus::Failed, later);
        assert_eq!(p.apply_update(&again).unwrap(), Transition::Redelivery);
        assert_eq!(p.updated_at, later);
        assert_eq!(p.completed_at, Some(now));
    }

    #[test]
    fn processing_sets_started_once() {
        let now = Utc::now();
        let mut p = job(now);
        let first = PredictionUpdate::status_only(p.id.clone(), PredictionStatus::Processing, now);
        p.apply_update(&first).unwrap();
        let later = PredictionUpdate::status_only(
            p.id.clone(),
            PredictionStatus::Processing,
            now + Duration::seconds(3),
        );
        assert_eq!(p.apply_update(&later).unwrap(), Transition::Redelivery);
        assert_eq!(p.started_at, Some(now));
    }

    #[test]
    fn rejects_update_for_other_job() {
        let now = Utc::now();
        let mut p = job(now);
        let other = PredictionUpdate::status_only(
            PredictionId::new("p-2").unwrap(),
            PredictionStatus::Failed,
            now,
        );
        assert!(matches!(
            p.apply_update(&other),
            Err(TransitionError::IdMismatch { .. })
        ));
        assert_eq!(p.status, PredictionStatus::Starting);
    }
}
