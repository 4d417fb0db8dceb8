//! # Typed event bus.
//!
//! [`EventBus`] keeps one [`tokio::sync::broadcast`] topic per event type.
//! Every component of the engine talks through it: the worker publishes
//! dispatched requests, provider bindings publish responses and completion
//! signals, UI hosts publish activity results.
//!
//! ```text
//! publish(DispatchedRequest) ──► [topic DispatchedRequest] ──► provider binding
//! publish(ResponseEvent)     ──► [topic ResponseEvent]     ──► worker, observers
//! publish(ActivityResult)    ──► [topic ActivityResult]    ──► activity monitor
//! ```
//!
//! ## Rules
//! - **Typed topics**: a subscriber only sees the event type it asked for.
//! - **Non-blocking publish**: `publish()` never waits on receivers.
//! - **Explicit lifetimes**: a [`Subscription`] receives events published after
//!   it was created and stops receiving when dropped.
//! - **Lag**: a receiver that falls more than `capacity` events behind skips the
//!   oldest ones; the skip is logged.

use std::any::{type_name, Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{error, warn};

/// Marker for values that can travel on the bus.
///
/// Auto-implemented for every `Clone + Send + Sync + 'static` type.
pub trait Event: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Event for T {}

type ErasedSender = Box<dyn Any + Send + Sync>;

/// Process-wide publish/subscribe channel with one topic per event type.
///
/// Cheap to clone; clones share the same topics.
#[derive(Clone)]
pub struct EventBus {
    topics: Arc<DashMap<TypeId, ErasedSender>>,
    capacity: usize,
}

impl EventBus {
    /// Creates a bus whose topics buffer up to `capacity` events (min 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Publishes an event to the current subscribers of its topic.
    ///
    /// Returns how many subscriptions received it. Zero means nobody was
    /// listening and the event was dropped.
    pub fn publish<E: Event>(&self, event: E) -> usize {
        match self.sender::<E>() {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Opens a subscription on the topic of `E`.
    pub fn subscribe<E: Event>(&self) -> Subscription<E> {
        let rx = match self.sender::<E>() {
            Some(tx) => tx.subscribe(),
            // unreachable in practice: the topic map is keyed by TypeId
            None => broadcast::channel::<E>(1).1,
        };
        Subscription { rx }
    }

    /// Number of live subscriptions on the topic of `E`.
    pub fn subscriber_count<E: Event>(&self) -> usize {
        self.sender::<E>().map_or(0, |tx| tx.receiver_count())
    }

    fn sender<E: Event>(&self) -> Option<broadcast::Sender<E>> {
        let entry = self
            .topics
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(broadcast::channel::<E>(self.capacity).0));
        let tx = entry.value().as_ref().downcast_ref::<broadcast::Sender<E>>().cloned();
        if tx.is_none() {
            error!(topic = type_name::<E>(), "event bus topic holds a foreign sender");
        }
        tx
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.topics.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Receiving end of one bus topic.
pub struct Subscription<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> Subscription<E> {
    /// Waits for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = type_name::<E>(), skipped, "subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns an already published event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(topic = type_name::<E>(), skipped, "subscription lagged");
                }
                Err(_) => return None,
            }
        }
    }
}
