//! Domain error model.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic rule failures raised by the pure crates.
///
/// Storage and transport failures have their own error types in
/// `artforge-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Caller-supplied input was rejected (tool parameters, codes, amounts).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A state the rules forbid, e.g. archiving a job that did not succeed.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The operation no longer applies, e.g. a code already redeemed or a
    /// reservation already settled the other way.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient credit: required {required}, available {available}")]
    InsufficientCredit { required: u64, available: u64 },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn insufficient_credit(required: u64, available: u64) -> Self {
        Self::InsufficientCredit {
            required,
            available,
        }
    }
}
