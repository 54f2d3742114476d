//! Ledger operations over loaded state.
//!
//! Callers hold the per-user lock, call one of these, then persist the mutated
//! balance, the reservation and any returned entry in the same unit of work.

use chrono::{DateTime, Utc};

use artforge_core::{DomainError, DomainResult};

use crate::balance::UserBalance;
use crate::entry::{LedgerEntry, TransactionKind};
use crate::redemption::RedemptionCode;
use crate::reservation::{Reservation, Settlement};

/// Result of a successful reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reserved {
    pub reservation: Reservation,
    /// `None` for zero-point jobs.
    pub entry: Option<LedgerEntry>,
}

/// Debit `points` up front and hold them against a new reservation.
pub fn reserve(
    balance: &mut UserBalance,
    points: u64,
    now: DateTime<Utc>,
) -> DomainResult<Reserved> {
    let reservation = Reservation::new(balance.user_id, points, now);
    if points == 0 {
        return Ok(Reserved {
            reservation,
            entry: None,
        });
    }

    let change = balance.debit(points, now)?;
    let entry = LedgerEntry::record(balance.user_id, TransactionKind::GenerationDebit, change, now)
        .with_reservation(reservation.id);
    Ok(Reserved {
        reservation,
        entry: Some(entry),
    })
}

/// Return a reservation's points to the balance.
///
/// Returns `Ok(None)` when the reservation was already refunded or held zero
/// points; a committed reservation cannot be refunded.
pub fn refund(
    balance: &mut UserBalance,
    reservation: &mut Reservation,
    now: DateTime<Utc>,
) -> DomainResult<Option<LedgerEntry>> {
    if balance.user_id != reservation.user_id {
        return Err(DomainError::invariant("reservation belongs to another user"));
    }
    if reservation.mark_refunded(now)? == Settlement::AlreadySettled || reservation.points == 0 {
        return Ok(None);
    }

    let change = balance.credit(reservation.points, now)?;
    let entry = LedgerEntry::record(balance.user_id, TransactionKind::Refund, change, now)
        .with_prediction(reservation.prediction_id.clone())
        .with_reservation(reservation.id);
    Ok(Some(entry))
}

/// Increase the balance outside the job flow.
pub fn credit(
    balance: &mut UserBalance,
    points: u64,
    kind: TransactionKind,
    metadata: serde_json::Value,
    now: DateTime<Utc>,
) -> DomainResult<LedgerEntry> {
    if points == 0 {
        return Err(DomainError::validation("credit must be positive"));
    }
    if kind == TransactionKind::GenerationDebit {
        return Err(DomainError::validation("generation debits are not credits"));
    }
    let change = balance.credit(points, now)?;
    Ok(LedgerEntry::record(balance.user_id, kind, change, now).with_metadata(metadata))
}

/// Apply a redemption code to a balance.
///
/// Plan-only codes produce no entry.
pub fn redeem(
    balance: &mut UserBalance,
    code: &mut RedemptionCode,
    now: DateTime<Utc>,
) -> DomainResult<Option<LedgerEntry>> {
    code.mark_redeemed(balance.user_id, now)?;

    if let Some(plan) = code.plan {
        balance.apply_plan(plan, code.points, code.plan_days, now);
    }
    if code.points == 0 {
        return Ok(None);
    }
    let metadata = serde_json::json!({ "code": code.code });
    credit(balance, code.points, TransactionKind::RedemptionCredit, metadata, now).map(Some)
}
