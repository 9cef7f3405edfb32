// src/event_bus.rs
//! Renderer notifications (resize, view changes, shader reloads).
//!
//! One bus per [`crate::Renderer`]: it owns its subscriber table and id
//! allocator, so nothing outlives the context that created it. Listeners
//! hold a [`Subscription`] and drain it at their own pace.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::view::ViewId;

// ============================================================================
// 1. EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SurfaceId(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum RendererEvent {
    /// The swap chain and every render target were rebuilt at `extent`.
    Resized { surface: SurfaceId, extent: (u32, u32) },
    ViewRegistered { surface: SurfaceId, view: ViewId },
    ViewDeregistered { surface: SurfaceId, view: ViewId },
    ShadersReloaded { surface: SurfaceId, reloaded: usize, kept: usize },
}

// ============================================================================
// 2. BUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct Subscription {
    id: SubscriptionId,
    receiver: Receiver<RendererEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Everything published since the last drain, oldest first.
    pub fn drain(&self) -> Vec<RendererEvent> {
        self.receiver.try_iter().collect()
    }

    pub fn try_next(&self) -> Option<RendererEvent> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Default)]
pub struct BusMetrics {
    pub published: AtomicUsize,
    pub delivered: AtomicUsize,
    pub dropped: AtomicUsize,
}

struct Subscriber {
    id: SubscriptionId,
    sender: Sender<RendererEvent>,
}

pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    queue_depth: usize,
    pub metrics: BusMetrics,
}

impl EventBus {
    /// `queue_depth` bounds each subscriber's backlog; events beyond it are
    /// dropped for that subscriber only.
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
            metrics: BusMetrics::default(),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = bounded(self.queue_depth);
        self.subscribers.lock().push(Subscriber { id, sender });
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Returns how many subscribers received the event. Subscribers whose
    /// [`Subscription`] was dropped are pruned here.
    pub fn publish(&self, event: RendererEvent) -> usize {
        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        let mut delivered = 0;

        self.subscribers.lock().retain(|subscriber| {
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("event bus subscriber {:?} is full; dropped {:?}", subscriber.id, event);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });

        self.metrics.delivered.fetch_add(delivered, Ordering::Relaxed);
        delivered
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
