//! # Engine assembly and host-facing handles.
//!
//! [`EngineBuilder`] wires the bus, the activity monitor and the worker;
//! [`EngineHandle`] controls a running engine and attaches
//! [`BillingClient`]s, one per UI or API surface.
//!
//! ```rust,ignore
//! let engine = Engine::builder(config)
//!     .with_store(Arc::new(FilePreferenceStore::open(path)?))
//!     .with_ui_host(host)
//!     .start();
//! engine.setup()?;
//!
//! let client = engine.attach(Some(&screen))?;
//! client.add_listener(Listener::new().on_purchase(|r| println!("{}", r.status)));
//! client.purchase("gems_100")?;
//! ```
//!
//! Every call is non-blocking: it enqueues a command for the worker and
//! returns. Outcomes arrive through listeners and on the bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot, watch};

use crate::activity::ActivityMonitor;
use crate::bus::EventBus;
use crate::config::{Configuration, EngineSettings};
use crate::dispatch::{Listener, ListenerId, ListenerSet};
use crate::error::TollgateError;
use crate::machine::EngineState;
use crate::request::{BillingRequest, ClientId, Purchase, RequestId};
use crate::setup::SetupManager;
use crate::store::{MemoryStore, PreferenceStore};
use crate::ui::{UiContext, UiHost};
use crate::worker::{Command, Worker};

/// Entry point for building an engine.
pub struct Engine;

impl Engine {
    pub fn builder(config: Configuration) -> EngineBuilder {
        EngineBuilder::new(config)
    }
}

/// Collects the collaborators of an engine.
///
/// Without a store, the provider preference lives in memory only. Without a
/// UI host, foreground flows that need a transient surface resolve to
/// absence.
pub struct EngineBuilder {
    config: Configuration,
    store: Option<Arc<dyn PreferenceStore>>,
    ui_host: Option<Arc<dyn UiHost>>,
    settings: EngineSettings,
}

impl EngineBuilder {
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            store: None,
            ui_host: None,
            settings: EngineSettings::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PreferenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_ui_host(mut self, host: Arc<dyn UiHost>) -> Self {
        self.ui_host = Some(host);
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Spawns the worker and the activity monitor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> EngineHandle {
        let bus = EventBus::new(self.settings.bus_capacity.max(1));
        let store: Arc<dyn PreferenceStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };

        let monitor = ActivityMonitor::new(bus.clone(), self.ui_host, &self.settings);
        let monitor_task = monitor.spawn_listener();

        let (commands, inbox) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(EngineState::Idle);
        let worker = Worker::new(
            bus.clone(),
            inbox,
            self.config,
            SetupManager::new(store),
            monitor_task,
            state_tx,
        );
        tokio::spawn(worker.run());

        EngineHandle {
            inner: Arc::new(HandleInner {
                commands,
                bus,
                monitor,
                state,
                next_client: AtomicU64::new(1),
            }),
        }
    }
}

struct HandleInner {
    commands: mpsc::UnboundedSender<Command>,
    bus: EventBus,
    monitor: ActivityMonitor,
    state: watch::Receiver<EngineState>,
    next_client: AtomicU64,
}

/// Controls a running engine. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<HandleInner>,
}

impl EngineHandle {
    /// Attaches a new client, optionally tied to the UI surface it serves.
    pub fn attach(&self, origin: Option<&Arc<dyn UiContext>>) -> Result<BillingClient, TollgateError> {
        let id = ClientId(self.inner.next_client.fetch_add(1, Ordering::Relaxed));
        let listeners = Arc::new(ListenerSet::new());
        self.send(Command::Attach {
            client: id,
            listeners: Arc::clone(&listeners),
        })?;

        Ok(BillingClient {
            id,
            origin: origin.map(Arc::downgrade),
            self_delivers: false,
            queue_when_busy: true,
            listeners,
            commands: self.inner.commands.clone(),
        })
    }

    /// Starts a provider selection cycle. Coalesced with one already running.
    pub fn setup(&self) -> Result<(), TollgateError> {
        self.send(Command::Setup)
    }

    /// Replaces the configuration. The engine goes back to `Idle` and needs a
    /// new [`setup`](Self::setup); queued requests are answered with
    /// `NoBillingProvider`.
    pub fn set_configuration(&self, config: Configuration) -> Result<(), TollgateError> {
        self.send(Command::SetConfiguration(config))
    }

    /// Stops the engine once the provider finished what it was handling.
    pub async fn shutdown(&self) -> Result<(), TollgateError> {
        let (done, stopped) = oneshot::channel();
        self.send(Command::Shutdown { done })?;
        stopped.await.map_err(|_| TollgateError::EngineStopped)
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn activity_monitor(&self) -> &ActivityMonitor {
        &self.inner.monitor
    }

    /// State as of the last event the worker processed.
    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.commands.is_closed()
    }

    fn send(&self, command: Command) -> Result<(), TollgateError> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| TollgateError::EngineStopped)
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

/// One caller's view of the engine.
///
/// Each operation returns the id the eventual response carries. Responses
/// reach the listeners added here. Dropping the client detaches it: its queue
/// is discarded and its listeners stop receiving.
pub struct BillingClient {
    id: ClientId,
    origin: Option<Weak<dyn UiContext>>,
    self_delivers: bool,
    queue_when_busy: bool,
    listeners: Arc<ListenerSet>,
    commands: mpsc::UnboundedSender<Command>,
}

impl BillingClient {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// When enabled (the default), requests made while the engine is busy
    /// are queued and replayed later. When disabled they are answered with
    /// `Busy` right away.
    pub fn queue_when_busy(mut self, enabled: bool) -> Self {
        self.queue_when_busy = enabled;
        self
    }

    /// Declares that the origin surface forwards activity results itself.
    pub fn self_delivers(mut self, enabled: bool) -> Self {
        self.self_delivers = enabled;
        self
    }

    pub fn add_listener(&self, listener: Listener) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn purchase(&self, sku: impl Into<String>) -> Result<RequestId, TollgateError> {
        self.post(BillingRequest::purchase(sku))
    }

    pub fn consume(&self, purchase: Purchase) -> Result<RequestId, TollgateError> {
        self.post(BillingRequest::consume(purchase))
    }

    /// Fetches owned purchases. `start_over` restarts paging.
    pub fn inventory(&self, start_over: bool) -> Result<RequestId, TollgateError> {
        self.post(BillingRequest::inventory(start_over))
    }

    pub fn sku_details<I, S>(&self, skus: I) -> Result<RequestId, TollgateError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.post(BillingRequest::sku_details(skus))
    }

    /// Posts an arbitrary request. It inherits this client's origin unless it
    /// carries its own.
    pub fn post(&self, request: BillingRequest) -> Result<RequestId, TollgateError> {
        let request = if request.origin_weak().is_none() {
            request.with_weak_origin(self.origin.clone(), self.self_delivers)
        } else {
            request
        };
        let id = RequestId::new();
        self.commands
            .send(Command::Post {
                client: self.id,
                id,
                request,
                queue_when_busy: self.queue_when_busy,
            })
            .map_err(|_| TollgateError::EngineStopped)?;
        Ok(id)
    }
}

impl Drop for BillingClient {
    fn drop(&mut self) {
        self.listeners.clear();
        let _ = self.commands.send(Command::Detach { client: self.id });
    }
}

impl std::fmt::Debug for BillingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingClient")
            .field("id", &self.id)
            .field("has_origin", &self.origin.is_some())
            .field("queue_when_busy", &self.queue_when_busy)
            .finish()
    }
}
