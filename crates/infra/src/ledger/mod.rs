//! Point ledger persistence.
//!
//! The rules live in `artforge_ledger::ops`; a [`LedgerStore`] loads the
//! affected rows under a per-user lock, runs the rule and writes everything
//! back in one unit of work.

mod in_memory;
mod postgres;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;

use thiserror::Error;

use artforge_core::{DomainError, Page, PageRequest, PredictionId, UserId};
use artforge_ledger::{
    LedgerEntry, RedemptionCode, Reservation, ReservationId, Settlement, TransactionKind,
    UserBalance,
};

use crate::db::DbError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("no account for user {0}")]
    AccountNotFound(UserId),

    #[error("reservation not found: {0}")]
    ReservationNotFound(String),

    #[error("redemption code not found")]
    CodeNotFound,

    #[error("ledger conflict: {0}")]
    Conflict(String),

    #[error("ledger storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn is_insufficient_credit(&self) -> bool {
        matches!(self, LedgerError::Domain(DomainError::InsufficientCredit { .. }))
    }
}

impl From<DbError> for LedgerError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::UniqueViolation { message, .. } => LedgerError::Conflict(message),
            other => LedgerError::Storage(other.to_string()),
        }
    }
}

/// Outcome of redeeming a code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redeemed {
    pub balance: UserBalance,
    /// `None` for plan-only codes.
    pub entry: Option<LedgerEntry>,
}

/// Balances, reservations and the append-only entry log.
///
/// Every mutation for one user is serialized; two concurrent reserves can
/// never both spend the same points.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Get or create the user's balance.
    async fn open_account(&self, user_id: UserId) -> Result<UserBalance, LedgerError>;

    async fn balance(&self, user_id: UserId) -> Result<Option<UserBalance>, LedgerError>;

    /// Read-only; `InsufficientCredit` when the balance does not cover `required`.
    async fn check_balance(&self, user_id: UserId, required: u64) -> Result<(), LedgerError>;

    /// Debit `points` now and hold them against a fresh reservation.
    async fn reserve(&self, user_id: UserId, points: u64) -> Result<Reservation, LedgerError>;

    /// Bind a reservation to the provider's job id.
    async fn attach(
        &self,
        reservation_id: ReservationId,
        prediction_id: &PredictionId,
    ) -> Result<Reservation, LedgerError>;

    /// Refund a reservation by its own id (used before a job id exists).
    async fn release(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Mark the job's points as spent. Idempotent.
    async fn commit(&self, prediction_id: &PredictionId) -> Result<Settlement, LedgerError>;

    /// Give the job's points back. At most one refund entry per job.
    async fn refund(&self, prediction_id: &PredictionId)
    -> Result<Option<LedgerEntry>, LedgerError>;

    async fn credit(
        &self,
        user_id: UserId,
        points: u64,
        kind: TransactionKind,
        metadata: serde_json::Value,
    ) -> Result<LedgerEntry, LedgerError>;

    async fn reservation(
        &self,
        prediction_id: &PredictionId,
    ) -> Result<Option<Reservation>, LedgerError>;

    /// Entries newest first.
    async fn transactions(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Page<LedgerEntry>, LedgerError>;

    async fn create_code(&self, code: RedemptionCode) -> Result<(), LedgerError>;

    async fn redeem(&self, user_id: UserId, code: &str) -> Result<Redeemed, LedgerError>;
}
