use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use artforge_core::{PredictionId, WorkId};
use artforge_predictions::{Prediction, PredictionStatus};

/// Status change pushed to listeners of one prediction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub prediction_id: PredictionId,
    pub status: PredictionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_id: Option<WorkId>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn from_prediction(prediction: &Prediction, work_id: Option<WorkId>) -> Self {
        Self {
            prediction_id: prediction.id.clone(),
            status: prediction.status,
            output: prediction.output.clone(),
            error: prediction.error.clone(),
            work_id,
            at: prediction.updated_at,
        }
    }

    /// Listeners can close their stream after this event.
    pub fn is_final(&self) -> bool {
        self.status.is_terminal()
    }
}
