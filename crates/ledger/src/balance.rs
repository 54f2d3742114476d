use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use artforge_core::{DomainError, DomainResult, UserId};

/// Subscription plan attached to a balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Basic,
    Premium,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Basic => "basic",
            PlanTier::Premium => "premium",
        }
    }
}

impl core::str::FromStr for PlanTier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(PlanTier::Free),
            "basic" => Ok(PlanTier::Basic),
            "premium" => Ok(PlanTier::Premium),
            other => Err(DomainError::validation(format!("unknown plan tier: {other}"))),
        }
    }
}

/// Largest balance we accept; entries store signed 64-bit amounts.
pub const MAX_POINTS: u64 = i64::MAX as u64;

/// A balance mutation, as recorded on the ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceChange {
    pub before: u64,
    pub after: u64,
}

impl BalanceChange {
    /// Signed amount (`after - before`).
    pub fn amount(&self) -> i64 {
        // Both sides are bounded by MAX_POINTS.
        self.after as i64 - self.before as i64
    }
}

/// A user's prepaid point balance.
///
/// Only mutated through [`crate::ops`]; `points` is unsigned so a negative
/// balance is unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBalance {
    pub user_id: UserId,
    pub points: u64,
    pub plan: PlanTier,
    pub plan_points: u64,
    pub plan_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserBalance {
    /// A fresh account: zero points on the free plan.
    pub fn open(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            points: 0,
            plan: PlanTier::Free,
            plan_points: 0,
            plan_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn ensure_covers(&self, required: u64) -> DomainResult<()> {
        if self.points < required {
            return Err(DomainError::insufficient_credit(required, self.points));
        }
        Ok(())
    }

    pub(crate) fn debit(&mut self, points: u64, now: DateTime<Utc>) -> DomainResult<BalanceChange> {
        self.ensure_covers(points)?;
        let before = self.points;
        self.points -= points;
        self.updated_at = now;
        Ok(BalanceChange {
            before,
            after: self.points,
        })
    }

    pub(crate) fn credit(
        &mut self,
        points: u64,
        now: DateTime<Utc>,
    ) -> DomainResult<BalanceChange> {
        let after = self
            .points
            .checked_add(points)
            .filter(|p| *p <= MAX_POINTS)
            .ok_or_else(|| DomainError::invariant("balance overflow"))?;
        let before = self.points;
        self.points = after;
        self.updated_at = now;
        Ok(BalanceChange { before, after })
    }

    /// Switch to `plan` for `days`, extending a still-running plan of the same tier.
    pub fn apply_plan(&mut self, plan: PlanTier, plan_points: u64, days: u32, now: DateTime<Utc>) {
        let start = match self.plan_expires_at {
            Some(expiry) if self.plan == plan && expiry > now => expiry,
            _ => now,
        };
        self.plan = plan;
        self.plan_points = plan_points;
        self.plan_expires_at = Some(start + Duration::days(i64::from(days)));
        self.updated_at = now;
    }

    pub fn plan_active(&self, now: DateTime<Utc>) -> bool {
        match self.plan_expires_at {
            Some(expiry) => expiry > now,
            None => self.plan == PlanTier::Free,
        }
    }
}
