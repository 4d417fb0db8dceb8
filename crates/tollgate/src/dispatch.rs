//! # Response buffering and listener fan-out.
//!
//! [`EventDispatcher`] decides *when* a response reaches listeners;
//! [`ListenerSet`] decides *which* callbacks see it.
//!
//! ```text
//!  ResponseEvent ──► busy? ──yes──► [buffer] ──(request handled)──┐
//!                      │                                          ▼
//!                      └──no─────────────────────────────► deliver(event)
//!                                                                 │
//!                                    ┌────────────────────────────┤
//!                                    ▼                            ▼
//!                        client ListenerSet               global ListenerSet
//!                     on_purchase / on_inventory /      (configuration listener)
//!                     on_consume / on_sku_details
//!                            + on_response
//! ```
//!
//! ## Rules
//! - Responses that arrive while a request is open are held back and released
//!   in arrival order once it completes; nothing is merged or reordered.
//! - A [`Listener`] is a bag of optional callbacks. Adding it files each
//!   callback in its own sub-list; removing it clears every sub-list under one
//!   lock.
//! - Callbacks run on the worker outside the set's lock. A panicking callback
//!   is logged and does not affect the others.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use smallvec::SmallVec;
use tracing::{debug, error};

use crate::events::{DispatchedRequest, ResponseEvent, SetupStartedEvent};
use crate::request::{BillingRequest, ClientId};
use crate::response::{BillingResponse, ResponsePayload};
use crate::setup::SetupResponse;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Per-event-kind callbacks. Unset callbacks are simply skipped.
///
/// ```rust,ignore
/// let listener = Listener::new()
///     .on_purchase(|r| println!("purchase: {:?}", r.status))
///     .on_setup_response(|s| println!("provider: {:?}", s.provider_name()));
/// ```
#[derive(Clone, Default)]
pub struct Listener {
    purchase: Option<Callback<BillingResponse>>,
    inventory: Option<Callback<BillingResponse>>,
    consume: Option<Callback<BillingResponse>>,
    sku_details: Option<Callback<BillingResponse>>,
    setup_started: Option<Callback<SetupStartedEvent>>,
    setup_response: Option<Callback<SetupResponse>>,
    request: Option<Callback<BillingRequest>>,
    response: Option<Callback<BillingResponse>>,
}

impl Listener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_purchase(mut self, f: impl Fn(&BillingResponse) + Send + Sync + 'static) -> Self {
        self.purchase = Some(Arc::new(f));
        self
    }

    pub fn on_inventory(mut self, f: impl Fn(&BillingResponse) + Send + Sync + 'static) -> Self {
        self.inventory = Some(Arc::new(f));
        self
    }

    pub fn on_consume(mut self, f: impl Fn(&BillingResponse) + Send + Sync + 'static) -> Self {
        self.consume = Some(Arc::new(f));
        self
    }

    pub fn on_sku_details(mut self, f: impl Fn(&BillingResponse) + Send + Sync + 'static) -> Self {
        self.sku_details = Some(Arc::new(f));
        self
    }

    pub fn on_setup_started(mut self, f: impl Fn(&SetupStartedEvent) + Send + Sync + 'static) -> Self {
        self.setup_started = Some(Arc::new(f));
        self
    }

    pub fn on_setup_response(mut self, f: impl Fn(&SetupResponse) + Send + Sync + 'static) -> Self {
        self.setup_response = Some(Arc::new(f));
        self
    }

    /// Called when a request is handed to the provider.
    pub fn on_request(mut self, f: impl Fn(&BillingRequest) + Send + Sync + 'static) -> Self {
        self.request = Some(Arc::new(f));
        self
    }

    /// Called for every response, after the kind-specific callback.
    pub fn on_response(mut self, f: impl Fn(&BillingResponse) + Send + Sync + 'static) -> Self {
        self.response = Some(Arc::new(f));
        self
    }
}

/// Handle returned by [`ListenerSet::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Entries<T> = SmallVec<[(ListenerId, Callback<T>); 2]>;

#[derive(Default)]
struct Lists {
    purchase: Entries<BillingResponse>,
    inventory: Entries<BillingResponse>,
    consume: Entries<BillingResponse>,
    sku_details: Entries<BillingResponse>,
    setup_started: Entries<SetupStartedEvent>,
    setup_response: Entries<SetupResponse>,
    request: Entries<BillingRequest>,
    response: Entries<BillingResponse>,
}

impl Lists {
    fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.count_entries();
        self.purchase.retain(|(l, _)| *l != id);
        self.inventory.retain(|(l, _)| *l != id);
        self.consume.retain(|(l, _)| *l != id);
        self.sku_details.retain(|(l, _)| *l != id);
        self.setup_started.retain(|(l, _)| *l != id);
        self.setup_response.retain(|(l, _)| *l != id);
        self.request.retain(|(l, _)| *l != id);
        self.response.retain(|(l, _)| *l != id);
        self.count_entries() != before
    }

    fn count_entries(&self) -> usize {
        self.purchase.len()
            + self.inventory.len()
            + self.consume.len()
            + self.sku_details.len()
            + self.setup_started.len()
            + self.setup_response.len()
            + self.request.len()
            + self.response.len()
    }

    fn for_response(&self, response: &BillingResponse) -> Vec<Callback<BillingResponse>> {
        let specific = match response.payload {
            ResponsePayload::Purchase { .. } => &self.purchase,
            ResponsePayload::Inventory { .. } => &self.inventory,
            ResponsePayload::Consume { .. } => &self.consume,
            ResponsePayload::SkuDetails { .. } => &self.sku_details,
        };
        specific
            .iter()
            .chain(self.response.iter())
            .map(|(_, cb)| Arc::clone(cb))
            .collect()
    }
}

fn snapshot<T>(entries: &Entries<T>) -> Vec<Callback<T>> {
    entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
}

fn invoke<T>(callbacks: Vec<Callback<T>>, value: &T) {
    for cb in callbacks {
        if catch_unwind(AssertUnwindSafe(|| cb(value))).is_err() {
            error!("billing listener panicked");
        }
    }
}

/// Composite of listeners, filed per callback kind.
#[derive(Default)]
pub struct ListenerSet {
    lists: Mutex<Lists>,
    next_id: AtomicU64,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every callback `listener` carries.
    pub fn add(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut lists = self.lock();
        if let Some(cb) = listener.purchase {
            lists.purchase.push((id, cb));
        }
        if let Some(cb) = listener.inventory {
            lists.inventory.push((id, cb));
        }
        if let Some(cb) = listener.consume {
            lists.consume.push((id, cb));
        }
        if let Some(cb) = listener.sku_details {
            lists.sku_details.push((id, cb));
        }
        if let Some(cb) = listener.setup_started {
            lists.setup_started.push((id, cb));
        }
        if let Some(cb) = listener.setup_response {
            lists.setup_response.push((id, cb));
        }
        if let Some(cb) = listener.request {
            lists.request.push((id, cb));
        }
        if let Some(cb) = listener.response {
            lists.response.push((id, cb));
        }
        id
    }

    /// Detaches a listener from every sub-list at once.
    pub fn remove(&self, id: ListenerId) -> bool {
        self.lock().remove(id)
    }

    pub fn clear(&self) {
        *self.lock() = Lists::default();
    }

    /// Total number of registered callbacks.
    pub fn callback_count(&self) -> usize {
        self.lock().count_entries()
    }

    pub fn notify_response(&self, response: &BillingResponse) {
        let callbacks = self.lock().for_response(response);
        invoke(callbacks, response);
    }

    pub fn notify_request(&self, request: &BillingRequest) {
        let callbacks = snapshot(&self.lock().request);
        invoke(callbacks, request);
    }

    pub fn notify_setup_started(&self, event: &SetupStartedEvent) {
        let callbacks = snapshot(&self.lock().setup_started);
        invoke(callbacks, event);
    }

    pub fn notify_setup_response(&self, response: &SetupResponse) {
        let callbacks = snapshot(&self.lock().setup_response);
        invoke(callbacks, response);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lists> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds responses back while a request is open and routes them to listeners.
pub struct EventDispatcher {
    buffer: Vec<ResponseEvent>,
    clients: BTreeMap<ClientId, Arc<ListenerSet>>,
    global: ListenerSet,
}

impl EventDispatcher {
    pub fn new(global: Option<Listener>) -> Self {
        let dispatcher = Self {
            buffer: Vec::new(),
            clients: BTreeMap::new(),
            global: ListenerSet::new(),
        };
        dispatcher.set_global(global);
        dispatcher
    }

    /// Replaces the configuration-wide listener.
    pub fn set_global(&self, listener: Option<Listener>) {
        self.global.clear();
        if let Some(listener) = listener {
            self.global.add(listener);
        }
    }

    pub fn attach(&mut self, client: ClientId, listeners: Arc<ListenerSet>) {
        self.clients.insert(client, listeners);
    }

    pub fn detach(&mut self, client: ClientId) {
        self.clients.remove(&client);
    }

    /// Delivers now, or buffers while `busy`.
    pub fn on_response(&mut self, event: ResponseEvent, busy: bool) {
        if busy {
            debug!(request_id = %event.request, buffered = self.buffer.len() + 1, "response held back");
            self.buffer.push(event);
        } else {
            self.deliver(&event);
        }
    }

    /// Releases everything held back, oldest first.
    pub fn release(&mut self) {
        for event in std::mem::take(&mut self.buffer) {
            self.deliver(&event);
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn on_request(&self, dispatched: &DispatchedRequest) {
        if let Some(set) = self.clients.get(&dispatched.client) {
            set.notify_request(&dispatched.request);
        }
        self.global.notify_request(&dispatched.request);
    }

    pub fn on_setup_started(&self, event: &SetupStartedEvent) {
        for set in self.clients.values() {
            set.notify_setup_started(event);
        }
        self.global.notify_setup_started(event);
    }

    pub fn on_setup_response(&self, response: &SetupResponse) {
        for set in self.clients.values() {
            set.notify_setup_response(response);
        }
        self.global.notify_setup_response(response);
    }

    fn deliver(&self, event: &ResponseEvent) {
        match self.clients.get(&event.client) {
            Some(set) => set.notify_response(&event.response),
            None => debug!(client = %event.client, "response for a detached client"),
        }
        self.global.notify_response(&event.response);
    }
}
