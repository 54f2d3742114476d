//! `artforge-predictions`: prediction jobs and the works they produce.
//!
//! Pure domain: operation kinds, typed tool inputs, the status state machine,
//! provider webhook payloads and archive entries. Persistence and provider I/O
//! live in `artforge-infra`.

pub mod catalog;
pub mod input;
pub mod kind;
pub mod payload;
pub mod prediction;
pub mod side_effect;
pub mod status;
pub mod work;

pub use catalog::{ModelCatalog, ModelSpec};
pub use input::ToolInput;
pub use kind::OperationKind;
pub use payload::ProviderWebhook;
pub use prediction::{Prediction, PredictionUpdate};
pub use side_effect::SideEffect;
pub use status::{PredictionStatus, Transition, TransitionError};
pub use work::{Work, WorkFilter, fallback_title, sanitize_title};
