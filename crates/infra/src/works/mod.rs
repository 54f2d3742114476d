//! Work archive: one gallery entry per succeeded job.

mod in_memory;
mod postgres;

pub use in_memory::InMemoryWorkArchive;
pub use postgres::PostgresWorkArchive;

use thiserror::Error;

use artforge_core::{DomainError, Page, PageRequest, PredictionId, UserId, WorkId};
use artforge_predictions::{Work, WorkFilter};

use crate::db::DbError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkArchiveError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("work archive conflict: {0}")]
    Conflict(String),

    #[error("work archive error: {0}")]
    Storage(String),
}

impl From<DbError> for WorkArchiveError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::UniqueViolation { message, .. } => WorkArchiveError::Conflict(message),
            other => WorkArchiveError::Storage(other.to_string()),
        }
    }
}

#[async_trait::async_trait]
pub trait WorkArchive: Send + Sync {
    /// Store `work` unless its prediction already has one; returns the stored row.
    async fn create(&self, work: Work) -> Result<Work, WorkArchiveError>;

    async fn find_by_prediction(
        &self,
        prediction_id: &PredictionId,
    ) -> Result<Option<Work>, WorkArchiveError>;

    /// The user's works matching `filter`, newest first.
    async fn list_for_user(
        &self,
        user_id: UserId,
        filter: &WorkFilter,
        page: PageRequest,
    ) -> Result<Page<Work>, WorkArchiveError>;

    /// Delete an owned work. `false` when it does not exist or is not the user's.
    async fn delete(&self, work_id: WorkId, user_id: UserId) -> Result<bool, WorkArchiveError>;
}
