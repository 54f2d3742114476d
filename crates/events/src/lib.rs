//! Job status fan-out to live listeners.
//!
//! The lifecycle publishes a [`JobEvent`] after every applied transition; SSE
//! connections subscribe per prediction id. Delivery is best-effort and never
//! blocks the publisher.

pub mod event;
pub mod hub;

pub use event::JobEvent;
pub use hub::{HubError, JobEventSink, NotificationHub, Subscription, SubscriptionHandle};
