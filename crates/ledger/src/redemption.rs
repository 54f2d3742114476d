use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use artforge_core::{DomainError, DomainResult, UserId};

use crate::balance::PlanTier;

/// Canonical form of a user-typed code: trimmed, upper-cased.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Single-use code granting points and optionally a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionCode {
    pub code: String,
    pub points: u64,
    pub plan: Option<PlanTier>,
    pub plan_days: u32,
    pub redeemed_by: Option<UserId>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RedemptionCode {
    pub fn new(
        code: &str,
        points: u64,
        plan: Option<PlanTier>,
        plan_days: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let code = normalize_code(code);
        if !(4..=64).contains(&code.len()) {
            return Err(DomainError::validation("code must be 4-64 characters"));
        }
        if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(DomainError::validation(
                "code may only contain letters, digits and '-'",
            ));
        }
        if points == 0 && plan.is_none() {
            return Err(DomainError::validation("code grants nothing"));
        }
        if plan.is_some() && plan_days == 0 {
            return Err(DomainError::validation("plan codes need a duration"));
        }
        Ok(Self {
            code,
            points,
            plan,
            plan_days,
            redeemed_by: None,
            redeemed_at: None,
            created_at: now,
        })
    }

    pub fn is_redeemed(&self) -> bool {
        self.redeemed_by.is_some()
    }

    pub fn mark_redeemed(&mut self, user_id: UserId, now: DateTime<Utc>) -> DomainResult<()> {
        if self.is_redeemed() {
            return Err(DomainError::conflict(format!(
                "code {} already redeemed",
                self.code
            )));
        }
        self.redeemed_by = Some(user_id);
        self.redeemed_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_normalized_and_validated() {
        let now = Utc::now();
        let c = RedemptionCode::new("  welcome-100 ", 100, None, 0, now).unwrap();
        assert_eq!(c.code, "WELCOME-100");

        assert!(RedemptionCode::new("abc", 100, None, 0, now).is_err());
        assert!(RedemptionCode::new("has space", 100, None, 0, now).is_err());
        assert!(RedemptionCode::new("EMPTY", 0, None, 0, now).is_err());
        assert!(RedemptionCode::new("PLAN", 0, Some(PlanTier::Basic), 0, now).is_err());
    }

    #[test]
    fn single_use() {
        let now = Utc::now();
        let mut c = RedemptionCode::new("ONCE", 5, None, 0, now).unwrap();
        c.mark_redeemed(UserId::new(), now).unwrap();
        assert!(matches!(
            c.mark_redeemed(UserId::new(), now),
            Err(DomainError::Conflict(_))
        ));
    }
}
