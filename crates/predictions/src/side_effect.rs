use serde::{Deserialize, Serialize};

use artforge_core::DomainError;

/// Side effects of a terminal transition, recorded per prediction once applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SideEffect {
    WorkCreated,
    LedgerCommitted,
    LedgerRefunded,
}

impl SideEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffect::WorkCreated => "work-created",
            SideEffect::LedgerCommitted => "ledger-committed",
            SideEffect::LedgerRefunded => "ledger-refunded",
        }
    }
}

impl core::str::FromStr for SideEffect {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "work-created" => Ok(SideEffect::WorkCreated),
            "ledger-committed" => Ok(SideEffect::LedgerCommitted),
            "ledger-refunded" => Ok(SideEffect::LedgerRefunded),
            other => Err(DomainError::validation(format!("unknown side effect: {other}"))),
        }
    }
}
