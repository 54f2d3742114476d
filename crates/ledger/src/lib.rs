//! `artforge-ledger`: point balances, ledger entries and reservations.
//!
//! Pure rules only. Stores in `artforge-infra` load these values, run the
//! operations in [`ops`] under a per-user lock and persist the result.

pub mod balance;
pub mod entry;
pub mod ops;
pub mod redemption;
pub mod reservation;

pub use balance::{BalanceChange, MAX_POINTS, PlanTier, UserBalance};
pub use entry::{EntryId, LedgerEntry, TransactionKind};
pub use ops::{Reserved, credit, redeem, refund, reserve};
pub use redemption::{RedemptionCode, normalize_code};
pub use reservation::{Reservation, ReservationId, ReservationState, Settlement};
