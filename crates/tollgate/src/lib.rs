//! # Tollgate
//!
//! One request/response API in front of several mutually incompatible in-app
//! billing vendors. The engine picks one usable provider, forwards billing
//! operations to it one at a time and hands the normalized results back to
//! whoever asked.
//!
//! ## Core Concepts
//!
//! - [`BillingProvider`] adapts one vendor. It reports availability and
//!   compatibility and answers [`BillingRequest`]s with [`BillingResponse`]s.
//! - [`SetupManager`] ranks the configured providers and persists the winner.
//! - [`RequestMachine`] keeps exactly one request in flight.
//! - [`RequestScheduler`] parks requests that arrive while the engine is busy.
//! - [`EventDispatcher`] holds responses back while a request is open and fans
//!   them out to [`Listener`]s.
//! - [`ActivityMonitor`] lets a provider run a foreground flow on the UI thread
//!   and wait for its result.
//!
//! ## Architecture
//!
//! ```text
//! BillingClient ── Command ──► Worker task
//!                                 │ RequestMachine / RequestScheduler
//!                                 │
//!                                 ▼ DispatchedRequest
//! EventBus ◄──────────────────────┴───────────────────────────────┐
//!     │                                                           │
//!     ▼                                                           │
//! ProviderBinding ─► BillingProvider.on_billing_request()         │
//!     │                    │                                      │
//!     │                    └─► ActivityResultRequest ─► ActivityMonitor ─► UiHost
//!     │                                                           │
//!     └─► ResponseEvent + RequestHandledEvent ────────────────────┘
//!                                 │
//!                                 ▼
//!                     EventDispatcher ─► Listener callbacks
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Single flight** - at most one request is dispatched to a provider at a
//!    time, engine-wide
//! 2. **Nothing is lost** - every request gets exactly one response: from the
//!    provider (possibly after a queued replay), or one the engine makes up:
//!    `Busy` when busy or already queued by someone else, `NoBillingProvider`
//!    without a provider or after reconfiguration, `UnknownError` when the
//!    request went stale
//! 3. **Completion order** - responses reach listeners in the order their
//!    requests completed, never interleaved with an open request
//! 4. **Stable selection** - a usable provider chosen before is chosen again
//! 5. **One rendezvous** - one foreground flow outstanding at a time
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tollgate::{Configuration, Engine, Listener};
//!
//! let config = Configuration::builder()
//!     .provider(Arc::new(AppStore::default()))
//!     .provider(Arc::new(AlternativeStore::default()))
//!     .auto_recover(true)
//!     .build()?;
//!
//! let engine = Engine::builder(config).start();
//! engine.setup()?;
//!
//! let client = engine.attach(None)?;
//! client.add_listener(
//!     Listener::new()
//!         .on_setup_response(|setup| println!("provider: {:?}", setup.provider_name()))
//!         .on_purchase(|response| println!("purchase: {}", response.status)),
//! );
//! client.purchase("gems_100")?;
//! ```
//!
//! ## What This Is Not
//!
//! Tollgate does not process payments, render UI, talk to the network or
//! validate receipts cryptographically. Those belong to providers, the host
//! application and a [`PurchaseVerifier`].

// Core modules
mod activity;
mod binding;
mod bus;
mod config;
mod dispatch;
mod engine;
mod error;
mod events;
mod handoff;
mod machine;
mod provider;
mod request;
mod response;
mod scheduler;
mod setup;
mod status;
mod store;
mod ui;
mod worker;

// Re-export engine types (primary entry point)
pub use engine::{BillingClient, Engine, EngineBuilder, EngineHandle};

// Re-export configuration types
pub use config::{Configuration, ConfigurationBuilder, EngineSettings};

// Re-export provider types
pub use provider::{BillingProvider, Compatibility, ProviderContext, ProviderTable, PurchaseVerifier};

// Re-export request/response model
pub use request::{BillingRequest, ClientId, Purchase, RequestId, RequestKind};
pub use response::{BillingResponse, ResponsePayload, SkuDetails, Verification};
pub use status::Status;

// Re-export engine components
pub use dispatch::{EventDispatcher, Listener, ListenerId, ListenerSet};
pub use machine::{EngineState, PostOutcome, RequestMachine};
pub use scheduler::{QueuedRequest, RequestScheduler};
pub use setup::{SetupManager, SetupResponse, SetupStatus};

// Re-export bus types
pub use bus::{Event, EventBus, Subscription};
pub use events::{
    DispatchedRequest, EngineAnswerEvent, RequestDroppedEvent, RequestHandledEvent, ResponseEvent,
    SetupStartedEvent,
};

// Re-export UI rendezvous types
pub use activity::{
    ActivityMonitor, ActivityResult, ActivityResultRequest, SurfaceState, RESULT_CANCELED, RESULT_OK,
};
pub use handoff::SyncedReference;
pub use ui::{launcher, LaunchFn, UiContext, UiHost};

// Re-export persistence types
pub use store::{MemoryStore, PreferenceStore, LAST_PROVIDER_KEY};

// Re-export error types
pub use error::{HandoffError, LaunchError, TollgateError};

// Re-export commonly used external types
pub use async_trait::async_trait;
