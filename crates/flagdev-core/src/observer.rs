//! In-process fan-out of flag changes to live subscribers.
//!
//! Delivery is at-most-once: nothing is queued for observers that register
//! later, and a subscriber whose buffer is full misses the event. Streaming
//! subscribers always start from a full snapshot, so a missed event is
//! repaired by the next one touching the same flag or by reconnecting.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::flags::{FlagState, FlagsState};

/// Identity handed out by [`Observers::register`].
pub type ObserverId = Uuid;

/// Full-project refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEvent {
    pub project_key: String,
    pub all_flags_state: FlagsState,
}

/// New effective state of a single overridden flag.
#[derive(Debug, Clone, PartialEq)]
pub struct OverrideEvent {
    pub project_key: String,
    pub flag_key: String,
    pub flag_state: FlagState,
}

/// An analytics or diagnostic payload posted by an SDK.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    pub kind: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    Sync(SyncEvent),
    Override(OverrideEvent),
    SdkEvent(ReceivedEvent),
}

impl ObserverEvent {
    /// Project the event concerns, if any.
    pub fn project_key(&self) -> Option<&str> {
        match self {
            ObserverEvent::Sync(e) => Some(&e.project_key),
            ObserverEvent::Override(e) => Some(&e.project_key),
            ObserverEvent::SdkEvent(_) => None,
        }
    }
}

pub trait Observer: Send + Sync {
    /// Must not block: called synchronously from the notifying request.
    fn handle(&self, event: &ObserverEvent);
}

/// Observer that forwards into a bounded channel without waiting.
pub struct ChannelObserver {
    tx: mpsc::Sender<ObserverEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::Sender<ObserverEvent>) -> Self {
        Self { tx }
    }
}

impl Observer for ChannelObserver {
    fn handle(&self, event: &ObserverEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Observer buffer full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Observer channel closed, dropping event");
            }
        }
    }
}

/// Concurrent registry of observers.
#[derive(Default)]
pub struct Observers {
    observers: DashMap<ObserverId, Arc<dyn Observer>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let id = Uuid::new_v4();
        self.observers.insert(id, observer);
        id
    }

    /// Returns false if the id was not registered.
    pub fn deregister(&self, id: ObserverId) -> bool {
        self.observers.remove(&id).is_some()
    }

    /// Dispatch to every registered observer. Returns how many were called.
    pub fn notify(&self, event: &ObserverEvent) -> usize {
        // Snapshot first so observers never run under a shard lock.
        let observers: Vec<Arc<dyn Observer>> = self
            .observers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for observer in &observers {
            observer.handle(event);
        }
        observers.len()
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Register a channel observer with a buffer of `capacity` events.
    ///
    /// The observer is deregistered when the returned subscription drops.
    pub fn subscribe(self: &Arc<Self>, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.register(Arc::new(ChannelObserver::new(tx)));
        Subscription {
            id,
            rx,
            observers: Arc::clone(self),
        }
    }
}

/// A registered channel observer and its receiving end.
pub struct Subscription {
    id: ObserverId,
    rx: mpsc::Receiver<ObserverEvent>,
    observers: Arc<Observers>,
}

impl Subscription {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ObserverEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ObserverEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.observers.deregister(self.id);
        tracing::debug!(observer = %self.id, "Observer deregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        calls: AtomicUsize,
    }

    impl Observer for CountingObserver {
        fn handle(&self, _event: &ObserverEvent) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sync_event(project: &str) -> ObserverEvent {
        ObserverEvent::Sync(SyncEvent {
            project_key: project.to_string(),
            all_flags_state: FlagsState::new(),
        })
    }

    #[test]
    fn test_notify_without_observers() {
        let observers = Observers::new();
        assert_eq!(observers.notify(&sync_event("p1")), 0);
    }

    #[test]
    fn test_notify_reaches_every_observer_once() {
        let observers = Observers::new();
        let a = Arc::new(CountingObserver::default());
        let b = Arc::new(CountingObserver::default());
        observers.register(a.clone());
        observers.register(b.clone());

        assert_eq!(observers.notify(&sync_event("p1")), 2);
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deregister() {
        let observers = Observers::new();
        let a = Arc::new(CountingObserver::default());
        let id = observers.register(a.clone());

        assert!(observers.deregister(id));
        assert!(!observers.deregister(id));
        observers.notify(&sync_event("p1"));
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subscription_receives_and_deregisters_on_drop() {
        let observers = Arc::new(Observers::new());
        let mut sub = observers.subscribe(4);
        assert_eq!(observers.len(), 1);

        observers.notify(&sync_event("p1"));
        let event = sub.recv().await.unwrap();
        assert_eq!(event.project_key(), Some("p1"));

        drop(sub);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_full_subscriber_does_not_block_others() {
        let observers = Arc::new(Observers::new());
        let mut slow = observers.subscribe(1);
        let mut fast = observers.subscribe(8);

        for _ in 0..3 {
            observers.notify(&sync_event("p1"));
        }

        assert!(slow.try_recv().is_some());
        assert!(slow.try_recv().is_none());

        let mut received = 0;
        while fast.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, 3);
    }
}
