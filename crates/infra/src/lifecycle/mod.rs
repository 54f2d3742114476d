//! Prediction lifecycle: submit, webhook intake and transition application.
//!
//! ```text
//! POST /jobs/:tool   -> reserve -> provider.create_job -> attach -> job store
//! POST /webhooks/:t  -> verify  -> parse -> enqueue ApplyTransition -> 200
//! TaskWorker         -> apply_transition -> work / commit / refund -> publish
//! ```
//!
//! Every side effect of a terminal transition is idempotent on its own
//! (unique work per prediction, one settlement per reservation, the
//! `applied_side_effects` log), so a task retried after a partial failure
//! finishes without duplicates.

mod error;
mod handler;
mod manager;

pub use error::LifecycleError;
pub use handler::TransitionHandler;
pub use manager::{
    Applied, LifecycleParts, PredictionLifecycle, Submitted, WebhookAck,
};
