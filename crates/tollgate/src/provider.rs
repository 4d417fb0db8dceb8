//! # Billing provider capability.
//!
//! A [`BillingProvider`] adapts one vendor SDK. The engine never looks past
//! this trait: selection, dispatch and lifecycle are written against it only.
//!
//! ## Contract
//! - `is_available()` and `check_compatibility()` are synchronous and fast; an
//!   unavailable provider must say so quickly.
//! - `on_billing_request()` always produces exactly one response. The provider
//!   binding publishes it together with the completion signal.
//! - `register_for_events()` / `unregister_for_events()` bracket the time the
//!   provider is the active one.
//!
//! Providers are resolved by identifier through a [`ProviderTable`] when the
//! configuration is built.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::activity::{ActivityResult, ActivityResultRequest};
use crate::bus::EventBus;
use crate::error::{HandoffError, TollgateError};
use crate::handoff::SyncedReference;
use crate::request::{BillingRequest, Purchase};
use crate::response::{BillingResponse, Verification};
use crate::ui::{LaunchFn, UiContext};

/// How well a provider fits the current device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Compatibility {
    Incompatible,
    Compatible,
    /// The device's own store; wins over merely compatible providers.
    Preferred,
}

/// A vendor billing backend.
#[async_trait]
pub trait BillingProvider: Send + Sync + 'static {
    /// Stable, unique identifier. Persisted as the preferred provider.
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    fn check_compatibility(&self) -> Compatibility;

    /// Handles one request and returns its response.
    ///
    /// Called from the provider's own task, one request at a time.
    async fn on_billing_request(&self, request: &BillingRequest, ctx: &ProviderContext) -> BillingResponse;

    /// Permissions the host must hold for this provider, if any.
    fn permissions(&self) -> Option<Vec<String>> {
        None
    }

    /// Called when the provider becomes the active one.
    fn register_for_events(&self, _bus: &EventBus) {}

    /// Called when the provider stops being the active one.
    fn unregister_for_events(&self) {}
}

impl fmt::Debug for dyn BillingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BillingProvider").field(&self.name()).finish()
    }
}

/// Checks vendor receipts. Pluggable; the engine only records the outcome.
pub trait PurchaseVerifier: Send + Sync + 'static {
    fn verify(&self, provider: &str, purchase: &Purchase) -> Verification;
}

/// What a provider can reach while handling a request.
#[derive(Clone)]
pub struct ProviderContext {
    bus: EventBus,
    origin: Option<Weak<dyn UiContext>>,
    self_delivers: bool,
}

impl ProviderContext {
    pub(crate) fn new(bus: EventBus, request: &BillingRequest) -> Self {
        Self {
            bus,
            origin: request.origin_weak(),
            self_delivers: request.self_delivers(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The surface that issued the request, if it still exists.
    pub fn origin(&self) -> Option<Arc<dyn UiContext>> {
        self.origin.as_ref().and_then(Weak::upgrade)
    }

    /// Launches a foreground flow and waits for its result.
    ///
    /// Returns `None` when the flow could not be started, no surface became
    /// ready, another flow was already outstanding, or `deadline` passed.
    pub async fn launch_for_result(
        &self,
        launch: LaunchFn,
        deadline: Option<Duration>,
    ) -> Option<ActivityResult> {
        let result = SyncedReference::new();
        let request = ActivityResultRequest {
            result: result.clone(),
            origin: self.origin.clone(),
            self_delivers: self.self_delivers,
            launch,
        };
        if self.bus.publish(request) == 0 {
            warn!("no activity monitor is listening; foreground flow not started");
            return None;
        }

        let outcome = match deadline {
            Some(deadline) => result.wait_timeout(deadline).await,
            None => result.wait().await,
        };
        match outcome {
            Ok(activity) => Some(activity),
            Err(HandoffError::Timeout(after)) => {
                // frees the monitor's slot for the next flow
                result.cancel();
                warn!(?after, "foreground flow timed out");
                None
            }
            Err(HandoffError::Cancelled) => None,
        }
    }
}

type Constructor = Arc<dyn Fn() -> Arc<dyn BillingProvider> + Send + Sync>;

/// Maps provider identifiers to constructors.
///
/// ```rust,ignore
/// let table = ProviderTable::new()
///     .register("google", || Arc::new(GooglePlay::default()))
///     .register("amazon", || Arc::new(AmazonAppstore::default()));
///
/// let config = Configuration::builder()
///     .providers_from(&table, ["google", "amazon"])?
///     .build()?;
/// ```
#[derive(Clone, Default)]
pub struct ProviderTable {
    entries: BTreeMap<String, Constructor>,
}

impl ProviderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `constructor` under `id`, replacing any previous entry.
    pub fn register<F>(mut self, id: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> Arc<dyn BillingProvider> + Send + Sync + 'static,
    {
        self.entries.insert(id.into(), Arc::new(constructor));
        self
    }

    pub fn create(&self, id: &str) -> Result<Arc<dyn BillingProvider>, TollgateError> {
        self.entries
            .get(id)
            .map(|constructor| constructor())
            .ok_or_else(|| TollgateError::UnknownProvider { id: id.to_string() })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Registered identifiers, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl fmt::Debug for ProviderTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;

    struct Fixed(&'static str);

    #[async_trait]
    impl BillingProvider for Fixed {
        fn name(&self) -> &str {
            self.0
        }
        fn is_available(&self) -> bool {
            true
        }
        fn check_compatibility(&self) -> Compatibility {
            Compatibility::Compatible
        }
        async fn on_billing_request(&self, request: &BillingRequest, _ctx: &ProviderContext) -> BillingResponse {
            BillingResponse::empty(request.kind(), Status::Success)
        }
    }

    #[test]
    fn table_resolves_registered_ids() {
        let table = ProviderTable::new()
            .register("one", || Arc::new(Fixed("one")))
            .register("two", || Arc::new(Fixed("two")));

        assert_eq!(table.create("two").unwrap().name(), "two");
        assert!(matches!(
            table.create("three"),
            Err(TollgateError::UnknownProvider { id }) if id == "three"
        ));
        assert_eq!(table.ids().collect::<Vec<_>>(), vec!["one", "two"]);
    }

    #[test]
    fn preferred_outranks_compatible() {
        assert!(Compatibility::Preferred > Compatibility::Compatible);
        assert!(Compatibility::Compatible > Compatibility::Incompatible);
    }

    #[tokio::test]
    async fn launch_without_monitor_gives_up_immediately() {
        let bus = EventBus::new(4);
        let ctx = ProviderContext::new(bus, &BillingRequest::purchase("x"));
        let launch = crate::ui::launcher(|_, _| Ok(()));
        assert!(ctx.launch_for_result(launch, None).await.is_none());
    }
}
