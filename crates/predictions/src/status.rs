use serde::{Deserialize, Serialize};
use thiserror::Error;

use artforge_core::PredictionId;

/// Job status as reported by the provider.
///
/// `starting -> processing -> {succeeded | failed | canceled}`; terminal
/// statuses never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionStatus::Starting => "starting",
            PredictionStatus::Processing => "processing",
            PredictionStatus::Succeeded => "succeeded",
            PredictionStatus::Failed => "failed",
            PredictionStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PredictionStatus::Succeeded | PredictionStatus::Failed | PredictionStatus::Canceled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            PredictionStatus::Starting => 0,
            PredictionStatus::Processing => 1,
            _ => 2,
        }
    }

    /// Decide what an incoming status does to a job currently in `self`.
    pub fn transition_to(&self, incoming: PredictionStatus) -> Transition {
        if *self == incoming {
            return Transition::Redelivery;
        }
        if self.is_terminal() {
            return if incoming.is_terminal() {
                Transition::Conflict
            } else {
                Transition::Stale
            };
        }
        if incoming.rank() > self.rank() {
            Transition::Apply
        } else {
            Transition::Stale
        }
    }
}

impl core::fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for PredictionStatus {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(PredictionStatus::Starting),
            "processing" => Ok(PredictionStatus::Processing),
            "succeeded" => Ok(PredictionStatus::Succeeded),
            "failed" => Ok(PredictionStatus::Failed),
            "canceled" | "cancelled" => Ok(PredictionStatus::Canceled),
            other => Err(TransitionError::UnknownStatus(other.to_string())),
        }
    }
}

/// Outcome of applying an incoming status to a stored job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    /// Forward move; the update was written.
    Apply,
    /// Same status again; only `updated_at` refreshed.
    Redelivery,
    /// A different terminal status after a terminal one; ignored.
    Conflict,
    /// Older non-terminal status arriving late; ignored.
    Stale,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Apply => "applied",
            Transition::Redelivery => "redelivered",
            Transition::Conflict => "conflicting",
            Transition::Stale => "stale",
        }
    }

    pub fn changed_status(&self) -> bool {
        matches!(self, Transition::Apply)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("unknown prediction status: {0}")]
    UnknownStatus(String),

    #[error("malformed provider payload: {0}")]
    MalformedPayload(String),

    #[error("update for {got} applied to prediction {expected}")]
    IdMismatch {
        expected: PredictionId,
        got: PredictionId,
    },
}
