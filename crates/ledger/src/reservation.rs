use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use artforge_core::{DomainError, DomainResult, PredictionId, UserId};

/// Reservation identifier, minted before the provider assigns a job id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(Uuid);

impl ReservationId {
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

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl core::str::FromStr for ReservationId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::invalid_id(format!("ReservationId: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Reserved,
    Committed,
    Refunded,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Reserved => "reserved",
            ReservationState::Committed => "committed",
            ReservationState::Refunded => "refunded",
        }
    }
}

impl core::str::FromStr for ReservationState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(ReservationState::Reserved),
            "committed" => Ok(ReservationState::Committed),
            "refunded" => Ok(ReservationState::Refunded),
            other => Err(DomainError::validation(format!(
                "unknown reservation state: {other}"
            ))),
        }
    }
}

/// Whether a settle call changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Applied,
    AlreadySettled,
}

/// Points held against one job.
///
/// A reservation settles exactly once: `reserved -> committed` or
/// `reserved -> refunded`. Repeating the same settlement is a no-op; the
/// opposite settlement is a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub user_id: UserId,
    pub prediction_id: Option<PredictionId>,
    pub points: u64,
    pub state: ReservationState,
    pub reserved_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub(crate) fn new(user_id: UserId, points: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: ReservationId::new(),
            user_id,
            prediction_id: None,
            points,
            state: ReservationState::Reserved,
            reserved_at: now,
            settled_at: None,
        }
    }

    /// Bind the provider's job id. Re-attaching the same id is allowed.
    pub fn attach(&mut self, prediction_id: PredictionId) -> DomainResult<()> {
        match &self.prediction_id {
            Some(existing) if *existing == prediction_id => Ok(()),
            Some(existing) => Err(DomainError::conflict(format!(
                "reservation {} already attached to {existing}",
                self.id
            ))),
            None => {
                self.prediction_id = Some(prediction_id);
                Ok(())
            }
        }
    }

    pub fn commit(&mut self, now: DateTime<Utc>) -> DomainResult<Settlement> {
        self.settle(ReservationState::Committed, now)
    }

    pub(crate) fn mark_refunded(&mut self, now: DateTime<Utc>) -> DomainResult<Settlement> {
        self.settle(ReservationState::Refunded, now)
    }

    pub fn is_settled(&self) -> bool {
        self.state != ReservationState::Reserved
    }

    fn settle(&mut self, target: ReservationState, now: DateTime<Utc>) -> DomainResult<Settlement> {
        match self.state {
            ReservationState::Reserved => {
                self.state = target;
                self.settled_at = Some(now);
                Ok(Settlement::Applied)
            }
            s if s == target => Ok(Settlement::AlreadySettled),
            s => Err(DomainError::conflict(format!(
                "reservation {} is {}, cannot become {}",
                self.id,
                s.as_str(),
                target.as_str()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> PredictionId {
        PredictionId::new(s).unwrap()
    }

    #[test]
    fn commit_is_idempotent() {
        let now = Utc::now();
        let mut r = Reservation::new(UserId::new(), 10, now);
        assert_eq!(r.commit(now).unwrap(), Settlement::Applied);
        assert_eq!(r.commit(now).unwrap(), Settlement::AlreadySettled);
        assert_eq!(r.state, ReservationState::Committed);
    }

    #[test]
    fn opposite_settlement_conflicts() {
        let now = Utc::now();
        let mut r = Reservation::new(UserId::new(), 10, now);
        r.mark_refunded(now).unwrap();
        assert!(matches!(r.commit(now), Err(DomainError::Conflict(_))));
        assert_eq!(r.state, ReservationState::Refunded);
    }

    #[test]
    fn attach_once() {
        let now = Utc::now();
        let mut r = Reservation::new(UserId::new(), 10, now);
        r.attach(pid("p1")).unwrap();
        r.attach(pid("p1")).unwrap();
        assert!(r.attach(pid("p2")).is_err());
        assert_eq!(r.prediction_id, Some(pid("p1")));
    }
}
