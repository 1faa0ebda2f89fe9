//! Broadcast signal bus.
//!
//! Every subscription owns an unbounded queue, so emitting never blocks on a
//! slow subscriber and never drops events. Emission happens under the
//! subscriber lock, which gives every subscriber the same global order.
//! Late subscribers see nothing that was emitted before they subscribed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::domain::Event;

static GLOBAL_BUS: OnceLock<SignalBus> = OnceLock::new();

/// Errors raised by bus management operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Signal bus has been disposed")]
    Disposed,

    #[error("The process-wide signal bus cannot be disposed")]
    GlobalDisposal,
}

/// Handle identifying one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<Arc<Event>>,
}

struct BusInner {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    disposed: AtomicBool,
    global: bool,
}

impl BusInner {
    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }
}

/// In-process broadcast channel for [`Event`]s. Cloning yields another handle
/// to the same bus.
#[derive(Clone)]
pub struct SignalBus {
    inner: Arc<BusInner>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBus")
            .field("global", &self.inner.global)
            .field("disposed", &self.is_disposed())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl SignalBus {
    /// Create an isolated, scoped bus
    pub fn new() -> Self {
        Self::build(false)
    }

    /// The process-wide default bus
    pub fn global() -> SignalBus {
        GLOBAL_BUS.get_or_init(|| Self::build(true)).clone()
    }

    fn build(global: bool) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
                global,
            }),
        }
    }

    /// Deliver an event to every current subscriber, in subscription order.
    /// A no-op once the bus is disposed.
    pub fn emit(&self, event: Event) {
        if self.is_disposed() {
            trace!(kind = event.kind.name(), "Dropping event emitted on disposed bus");
            return;
        }

        let event = Arc::new(event);
        let mut subscribers = self.inner.subscribers();
        // Receivers that were dropped without unsubscribing are pruned here
        subscribers.retain(|s| s.tx.send(Arc::clone(&event)).is_ok());
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Result<Subscription, BusError> {
        if self.is_disposed() {
            return Err(BusError::Disposed);
        }

        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers().push(Subscriber { id, tx });
        debug!(subscription = id.0, "Subscribed to signal bus");

        Ok(Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Stop delivery to a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.remove(id)
    }

    /// Close the bus. Pending events already queued stay readable; subscribers
    /// then observe the end of their stream.
    pub fn dispose(&self) -> Result<(), BusError> {
        if self.inner.global {
            return Err(BusError::GlobalDisposal);
        }

        self.inner.disposed.store(true, Ordering::Release);
        self.inner.subscribers().clear();
        debug!("Signal bus disposed");
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn is_global(&self) -> bool {
        self.inner.global
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Arc<Event>>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event. Returns None once unsubscribed or disposed
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }

    /// Take the next already-delivered event without waiting
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventKind, JobId};
    use serde_json::json;

    fn started(id: &str) -> Event {
        Event::for_job(&JobId::new(id), "test", EventKind::Started)
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let bus = SignalBus::new();
        let mut first = bus.subscribe().unwrap();
        let mut second = bus.subscribe().unwrap();

        for i in 0..5 {
            bus.emit(started(&format!("job-{}", i)));
        }

        for sub in [&mut first, &mut second] {
            for i in 0..5 {
                let event = sub.recv().await.unwrap();
                assert!(event.correlates_with(&JobId::new(format!("job-{}", i))));
            }
        }
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let bus = SignalBus::new();
        bus.emit(started("early"));

        let mut late = bus.subscribe().unwrap();
        bus.emit(started("late"));

        let event = late.recv().await.unwrap();
        assert!(event.correlates_with(&JobId::new("late")));
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_drop() {
        let bus = SignalBus::new();
        let mut kept = bus.subscribe().unwrap();
        let removed = bus.subscribe().unwrap();
        assert_eq!(bus.subscriber_count(), 2);

        assert!(bus.unsubscribe(removed.id()));
        assert!(!bus.unsubscribe(removed.id()));

        {
            let _scoped = bus.subscribe().unwrap();
            assert_eq!(bus.subscriber_count(), 2);
        }
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(Event::domain("ping", json!(null)));
        assert!(kept.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_dispose_closes_bus() {
        let bus = SignalBus::new();
        let mut sub = bus.subscribe().unwrap();

        bus.dispose().unwrap();
        bus.emit(started("after-dispose")); // must not panic

        assert!(sub.recv().await.is_none());
        assert_eq!(bus.subscribe().err(), Some(BusError::Disposed));
    }

    #[test]
    fn test_global_bus_cannot_be_disposed() {
        let bus = SignalBus::global();
        assert!(bus.is_global());
        assert_eq!(bus.dispose(), Err(BusError::GlobalDisposal));
        assert!(!SignalBus::global().is_disposed());
    }
}
