use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use artforge_core::{DomainError, PredictionId, UserId};

use crate::balance::BalanceChange;
use crate::reservation::ReservationId;

/// Ledger entry identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for EntryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionKind {
    GenerationDebit,
    Refund,
    RedemptionCredit,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::GenerationDebit => "generation-debit",
            TransactionKind::Refund => "refund",
            TransactionKind::RedemptionCredit => "redemption-credit",
        }
    }
}

impl core::str::FromStr for TransactionKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generation-debit" => Ok(TransactionKind::GenerationDebit),
            "refund" => Ok(TransactionKind::Refund),
            "redemption-credit" => Ok(TransactionKind::RedemptionCredit),
            other => Err(DomainError::validation(format!(
                "unknown transaction kind: {other}"
            ))),
        }
    }
}

/// One immutable balance movement.
///
/// `balance_after == balance_before + amount` always holds for entries built
/// through [`LedgerEntry::record`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub user_id: UserId,
    pub amount: i64,
    pub kind: TransactionKind,
    pub balance_before: u64,
    pub balance_after: u64,
    pub prediction_id: Option<PredictionId>,
    pub reservation_id: Option<ReservationId>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn record(
        user_id: UserId,
        kind: TransactionKind,
        change: BalanceChange,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EntryId::new(),
            user_id,
            amount: change.amount(),
            kind,
            balance_before: change.before,
            balance_after: change.after,
            prediction_id: None,
            reservation_id: None,
            metadata: serde_json::Value::Null,
            created_at: now,
        }
    }

    pub fn with_prediction(mut self, prediction_id: Option<PredictionId>) -> Self {
        self.prediction_id = prediction_id;
        self
    }

    pub fn with_reservation(mut self, reservation_id: ReservationId) -> Self {
        self.reservation_id = Some(reservation_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_consistent(&self) -> bool {
        i128::from(self.balance_before) + i128::from(self.amount) == i128::from(self.balance_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_derives_signed_amount() {
        let now = Utc::now();
        let debit = LedgerEntry::record(
            UserId::new(),
            TransactionKind::GenerationDebit,
            BalanceChange { before: 15, after: 0 },
            now,
        );
        assert_eq!(debit.amount, -15);
        assert!(debit.is_consistent());

        let credit = LedgerEntry::record(
            UserId::new(),
            TransactionKind::Refund,
            BalanceChange { before: 0, after: 15 },
            now,
        );
        assert_eq!(credit.amount, 15);
        assert!(credit.is_consistent());
    }

    #[test]
    fn kind_serializes_kebab_case() {
        let json = serde_json::to_string(&TransactionKind::GenerationDebit).unwrap();
        assert_eq!(json, "\"generation-debit\"");
        assert_eq!(
            "redemption-credit".parse::<TransactionKind>().unwrap(),
            TransactionKind::RedemptionCredit
        );
    }
}
