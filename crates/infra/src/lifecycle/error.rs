use thiserror::Error;

use artforge_core::DomainError;

use crate::ledger::LedgerError;
use crate::predictions::PredictionStoreError;
use crate::tasks::TaskQueueError;
use crate::works::WorkArchiveError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("insufficient credit: required {required}, available {available}")]
    InsufficientCredit { required: u64, available: u64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// The provider did not accept the job; the reservation was released.
    #[error("job provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("malformed webhook: {0}")]
    MalformedWebhook(String),

    #[error("webhook signature headers missing: {0}")]
    MissingSignatureHeaders(String),

    /// A step of `apply_transition` failed.
    #[error("transition stage `{stage}` failed: {message}")]
    Stage {
        stage: &'static str,
        message: String,
        retryable: bool,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl LifecycleError {
    /// Whether running the same work again can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LifecycleError::Storage(_) | LifecycleError::ProviderUnavailable(_) => true,
            LifecycleError::Stage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Wrap an error with the transition stage it happened in.
    pub(crate) fn at<E: Into<LifecycleError>>(
        stage: &'static str,
    ) -> impl FnOnce(E) -> LifecycleError {
        move |err| {
            let err = err.into();
            LifecycleError::Stage {
                stage,
                retryable: err.is_retryable(),
                message: err.to_string(),
            }
        }
    }
}

impl From<DomainError> for LifecycleError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InsufficientCredit {
                required,
                available,
            } => LifecycleError::InsufficientCredit {
                required,
                available,
            },
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                LifecycleError::Validation(msg)
            }
            DomainError::Conflict(msg) | DomainError::InvariantViolation(msg) => {
                LifecycleError::Conflict(msg)
            }
        }
    }
}

impl From<LedgerError> for LifecycleError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Domain(e) => e.into(),
            LedgerError::AccountNotFound(_)
            | LedgerError::ReservationNotFound(_)
            | LedgerError::CodeNotFound => LifecycleError::NotFound,
            LedgerError::Conflict(msg) => LifecycleError::Conflict(msg),
            LedgerError::Storage(msg) => LifecycleError::Storage(msg),
        }
    }
}

impl From<PredictionStoreError> for LifecycleError {
    fn from(err: PredictionStoreError) -> Self {
        match err {
            PredictionStoreError::Domain(e) => e.into(),
            PredictionStoreError::Transition(e) => LifecycleError::MalformedWebhook(e.to_string()),
            PredictionStoreError::AlreadyExists(id) => {
                LifecycleError::Conflict(format!("prediction {id} already exists"))
            }
            PredictionStoreError::Conflict(msg) => LifecycleError::Conflict(msg),
            PredictionStoreError::Storage(msg) => LifecycleError::Storage(msg),
        }
    }
}

impl From<WorkArchiveError> for LifecycleError {
    fn from(err: WorkArchiveError) -> Self {
        match err {
            WorkArchiveError::Domain(e) => e.into(),
            // A concurrent insert for the same prediction; the next attempt finds it.
            WorkArchiveError::Conflict(msg) => LifecycleError::Storage(msg),
            WorkArchiveError::Storage(msg) => LifecycleError::Storage(msg),
        }
    }
}

impl From<TaskQueueError> for LifecycleError {
    fn from(err: TaskQueueError) -> Self {
        LifecycleError::Storage(err.to_string())
    }
}

impl From<crate::external::StorageError> for LifecycleError {
    fn from(err: crate::external::StorageError) -> Self {
        LifecycleError::Storage(err.to_string())
    }
}
