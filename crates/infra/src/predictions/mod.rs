//! Job store: prediction records plus the applied side-effect log.

mod in_memory;
mod postgres;

pub use in_memory::InMemoryPredictionStore;
pub use postgres::PostgresPredictionStore;

use thiserror::Error;

use artforge_core::{DomainError, Page, PageRequest, PredictionId, UserId};
use artforge_predictions::{Prediction, PredictionUpdate, SideEffect, Transition, TransitionError};

use crate::db::DbError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PredictionStoreError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("prediction already exists: {0}")]
    AlreadyExists(PredictionId),

    #[error("prediction store conflict: {0}")]
    Conflict(String),

    #[error("prediction store error: {0}")]
    Storage(String),
}

impl From<DbError> for PredictionStoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::UniqueViolation { message, .. } => PredictionStoreError::Conflict(message),
            other => PredictionStoreError::Storage(other.to_string()),
        }
    }
}

/// Result of an upsert: the record after the update and what the update did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    pub prediction: Prediction,
    pub transition: Transition,
}

#[async_trait::async_trait]
pub trait PredictionStore: Send + Sync {
    async fn create(&self, prediction: &Prediction) -> Result<(), PredictionStoreError>;

    async fn get(&self, id: &PredictionId) -> Result<Option<Prediction>, PredictionStoreError>;

    /// Apply a provider update under the state machine.
    ///
    /// Updates for one id are serialized. Returns `None` for unknown ids.
    async fn upsert(
        &self,
        update: &PredictionUpdate,
    ) -> Result<Option<Upserted>, PredictionStoreError>;

    /// The user's jobs, newest first.
    async fn list_for_user(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Page<Prediction>, PredictionStoreError>;

    async fn has_applied(
        &self,
        id: &PredictionId,
        effect: SideEffect,
    ) -> Result<bool, PredictionStoreError>;

    /// Record an applied effect; `false` when it was already recorded.
    async fn record_applied(
        &self,
        id: &PredictionId,
        effect: SideEffect,
    ) -> Result<bool, PredictionStoreError>;

    async fn applied(&self, id: &PredictionId) -> Result<Vec<SideEffect>, PredictionStoreError>;
}
