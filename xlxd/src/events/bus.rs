//! Best-effort fan-out of events to any number of listeners.
//!
//! Each listener owns a bounded queue. Publishing never waits: when a
//! listener's queue is full the event is dropped for that listener only and
//! counted, so one slow consumer cannot stall the publisher or its peers.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::{Event, EventFilter};

/// Opaque identifier of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

struct Listener {
    tx: mpsc::Sender<Arc<Event>>,
    filter: EventFilter,
    dropped: Arc<AtomicU64>,
}

struct BusInner {
    listeners: RwLock<HashMap<ListenerHandle, Listener>>,
    next_id: AtomicU64,
    capacity: usize,
    dropped_total: AtomicU64,
}

impl BusInner {
    fn remove(&self, handle: ListenerHandle) -> bool {
        self.listeners.write().remove(&handle).is_some()
    }
}

/// Publish/subscribe broadcaster for [`Event`]s.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus whose listeners buffer up to `capacity` events each.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                dropped_total: AtomicU64::new(0),
            }),
        }
    }

    /// Register a listener for every event published from now on.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with(EventFilter::all(), self.inner.capacity)
    }

    /// Register a filtered listener with its own buffer size.
    pub fn subscribe_with(&self, filter: EventFilter, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = ListenerHandle(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let dropped = Arc::new(AtomicU64::new(0));

        self.inner.listeners.write().insert(
            handle,
            Listener {
                tx,
                filter,
                dropped: Arc::clone(&dropped),
            },
        );
        debug!(listener = handle.0, "Event listener subscribed");

        Subscription {
            handle,
            rx,
            dropped,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a listener. Unknown handles are ignored.
    pub fn unsubscribe(&self, handle: ListenerHandle) {
        if self.inner.remove(handle) {
            debug!(listener = handle.0, "Event listener unsubscribed");
        }
    }

    /// Deliver an event to every matching listener without blocking.
    pub fn publish(&self, event: Event) {
        let event = Arc::new(event);
        let mut closed = Vec::new();
        let mut lagging = Vec::new();

        {
            let listeners = self.inner.listeners.read();
            for (handle, listener) in listeners.iter() {
                if !listener.filter.matches(&event) {
                    continue;
                }
                match listener.tx.try_send(Arc::clone(&event)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.inner.dropped_total.fetch_add(1, Ordering::Relaxed);
                        if listener.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                            lagging.push(*handle);
                        }
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*handle),
                }
            }
        }

        if !closed.is_empty() {
            let mut listeners = self.inner.listeners.write();
            for handle in &closed {
                listeners.remove(handle);
            }
        }
        for handle in lagging {
            warn!(listener = handle.0, "Event listener is falling behind, dropping events");
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Events dropped across all listeners since the bus was created.
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// Live, non-restartable sequence of events for one listener.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    handle: ListenerHandle,
    rx: mpsc::Receiver<Arc<Event>>,
    dropped: Arc<AtomicU64>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn handle(&self) -> ListenerHandle {
        self.handle
    }

    /// Next event, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.rx.try_recv().ok()
    }

    /// Events this listener lost to a full buffer.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Stream for Subscription {
    type Item = Arc<Event>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.handle);
        }
    }
}
