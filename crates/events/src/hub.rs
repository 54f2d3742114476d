//! Process-wide registry of live job listeners.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::{debug, warn};

use artforge_core::PredictionId;

use crate::event::JobEvent;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Publish failed due to internal lock poisoning.
    #[error("notification registry lock poisoned")]
    Poisoned,
}

/// Where the lifecycle sends job events.
pub trait JobEventSink: Send + Sync {
    /// Returns how many listeners received the event.
    fn publish(&self, event: JobEvent) -> Result<usize, HubError>;
}

type Listeners = HashMap<PredictionId, Vec<(u64, mpsc::UnboundedSender<JobEvent>)>>;

#[derive(Debug, Default)]
struct Inner {
    listeners: Mutex<Listeners>,
    next_id: AtomicU64,
}

impl Inner {
    fn remove(&self, handle: &SubscriptionHandle) -> bool {
        let Ok(mut listeners) = self.listeners.lock() else {
            return false;
        };
        let Some(list) = listeners.get_mut(&handle.prediction_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != handle.id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(&handle.prediction_id);
        }
        removed
    }
}

/// In-memory pub/sub keyed by prediction id.
///
/// - Unbounded channels; publish never awaits
/// - No listeners: the event is dropped
/// - Closed listeners are pruned on the next publish
#[derive(Debug, Clone, Default)]
pub struct NotificationHub {
    inner: Arc<Inner>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, prediction_id: PredictionId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        // A poisoned registry still hands out a subscription; it just never
        // receives anything.
        match self.inner.listeners.lock() {
            Ok(mut listeners) => {
                listeners.entry(prediction_id.clone()).or_default().push((id, tx));
            }
            Err(_) => {
                warn!(%prediction_id, "notification registry poisoned; listener not registered");
            }
        }

        Subscription {
            handle: SubscriptionHandle { prediction_id, id },
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every live listener of its prediction.
    pub fn publish(&self, event: JobEvent) -> Result<usize, HubError> {
        let mut listeners = self.inner.listeners.lock().map_err(|_| HubError::Poisoned)?;

        let Some(list) = listeners.get_mut(&event.prediction_id) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        let delivered = list.len();
        if delivered < before {
            debug!(
                prediction_id = %event.prediction_id,
                pruned = before - delivered,
                "dropped closed job listeners"
            );
        }
        if list.is_empty() {
            listeners.remove(&event.prediction_id);
        }
        Ok(delivered)
    }

    /// Explicitly deregister; also happens when the [`Subscription`] drops.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.inner.remove(handle)
    }

    pub fn listener_count(&self, prediction_id: &PredictionId) -> usize {
        self.inner
            .listeners
            .lock()
            .map(|l| l.get(prediction_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl JobEventSink for NotificationHub {
    fn publish(&self, event: JobEvent) -> Result<usize, HubError> {
        NotificationHub::publish(self, event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub prediction_id: PredictionId,
    id: u64,
}

/// Stream of events for one prediction. Deregisters on drop.
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    rx: mpsc::UnboundedReceiver<JobEvent>,
    hub: Weak<Inner>,
}

impl Subscription {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<JobEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = JobEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            inner.remove(&self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artforge_predictions::PredictionStatus;
    use chrono::Utc;
    use tokio_stream::StreamExt;

    fn pid(s: &str) -> PredictionId {
        PredictionId::new(s).unwrap()
    }

    fn event(id: &str, status: PredictionStatus) -> JobEvent {
        JobEvent {
            prediction_id: pid(id),
            status,
            output: None,
            error: None,
            work_id: None,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn fans_out_to_every_listener_of_the_job() {
        let hub = NotificationHub::new();
        let mut a = hub.subscribe(pid("p1"));
        let mut b = hub.subscribe(pid("p1"));
        let mut other = hub.subscribe(pid("p2"));

        let delivered = hub.publish(event("p1", PredictionStatus::Processing)).unwrap();
        assert_eq!(delivered, 2);

        assert_eq!(a.next().await.unwrap().status, PredictionStatus::Processing);
        assert_eq!(b.recv().await.unwrap().status, PredictionStatus::Processing);
        assert!(other.try_recv().is_none());
    }

    #[test]
    fn publish_without_listeners_is_dropped() {
        let hub = NotificationHub::new();
        assert_eq!(hub.publish(event("nobody", PredictionStatus::Failed)).unwrap(), 0);
    }

    #[test]
    fn drop_deregisters() {
        let hub = NotificationHub::new();
        let sub = hub.subscribe(pid("p1"));
        let keep = hub.subscribe(pid("p1"));
        assert_eq!(hub.listener_count(&pid("p1")), 2);

        drop(sub);
        assert_eq!(hub.listener_count(&pid("p1")), 1);

        assert!(hub.unsubscribe(keep.handle()));
        assert!(!hub.unsubscribe(keep.handle()));
        assert_eq!(hub.listener_count(&pid("p1")), 0);
    }

    #[test]
    fn closed_receivers_are_pruned_on_publish() {
        let hub = NotificationHub::new();
        let mut sub = hub.subscribe(pid("p1"));
        let handle = sub.handle().clone();
        // Close the channel while skipping the drop-time deregistration.
        sub.hub = Weak::new();
        sub.rx.close();
        drop(sub);

        assert_eq!(hub.listener_count(&handle.prediction_id), 1);
        assert_eq!(hub.publish(event("p1", PredictionStatus::Succeeded)).unwrap(), 0);
        assert_eq!(hub.listener_count(&handle.prediction_id), 0);
    }
}
