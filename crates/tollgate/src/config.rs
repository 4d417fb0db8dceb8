//! # Configuration.
//!
//! Two layers:
//! - [`Configuration`]: billing policy chosen by the host application (which
//!   providers, in which order, which listener, stale/recovery flags). Handing
//!   a new one to the engine resets it.
//! - [`EngineSettings`]: runtime tunables with sensible defaults, loadable from
//!   JSON. Fixed for the lifetime of an engine.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::Listener;
use crate::error::TollgateError;
use crate::provider::{BillingProvider, ProviderTable, PurchaseVerifier};

/// Immutable billing policy.
#[derive(Clone)]
pub struct Configuration {
    providers: Vec<Arc<dyn BillingProvider>>,
    listener: Option<Listener>,
    verifier: Option<Arc<dyn PurchaseVerifier>>,
    skip_stale_requests: bool,
    auto_recover: bool,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// Providers in configured (priority) order.
    pub fn providers(&self) -> &[Arc<dyn BillingProvider>] {
        &self.providers
    }

    pub fn provider(&self, name: &str) -> Option<&Arc<dyn BillingProvider>> {
        self.providers.iter().find(|p| p.name() == name)
    }

    /// Listener that sees every event, regardless of which client caused it.
    pub fn listener(&self) -> Option<&Listener> {
        self.listener.as_ref()
    }

    pub fn verifier(&self) -> Option<&Arc<dyn PurchaseVerifier>> {
        self.verifier.as_ref()
    }

    /// Drop requests whose UI is gone or in the background before dispatch.
    pub fn skip_stale_requests(&self) -> bool {
        self.skip_stale_requests
    }

    /// Re-run selection when the active provider reports billing unavailable.
    pub fn auto_recover(&self) -> bool {
        self.auto_recover
    }

    /// Sorted union of every configured provider's permissions.
    pub fn required_permissions(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter_map(|p| p.permissions())
            .flatten()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.providers.iter().map(|p| p.name()).collect();
        f.debug_struct("Configuration")
            .field("providers", &names)
            .field("listener", &self.listener.is_some())
            .field("verifier", &self.verifier.is_some())
            .field("skip_stale_requests", &self.skip_stale_requests)
            .field("auto_recover", &self.auto_recover)
            .finish()
    }
}

/// Builder for [`Configuration`].
#[derive(Default)]
pub struct ConfigurationBuilder {
    providers: Vec<Arc<dyn BillingProvider>>,
    listener: Option<Listener>,
    verifier: Option<Arc<dyn PurchaseVerifier>>,
    skip_stale_requests: bool,
    auto_recover: bool,
}

impl ConfigurationBuilder {
    /// Appends a provider. Order is priority order.
    pub fn provider(mut self, provider: Arc<dyn BillingProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Appends providers resolved by identifier.
    pub fn providers_from<I, S>(mut self, table: &ProviderTable, ids: I) -> Result<Self, TollgateError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for id in ids {
            self.providers.push(table.create(id.as_ref())?);
        }
        Ok(self)
    }

    pub fn listener(mut self, listener: Listener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn PurchaseVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn skip_stale_requests(mut self, enabled: bool) -> Self {
        self.skip_stale_requests = enabled;
        self
    }

    pub fn auto_recover(mut self, enabled: bool) -> Self {
        self.auto_recover = enabled;
        self
    }

    /// Validates and freezes the configuration.
    ///
    /// Fails when no provider is configured or two share a name.
    pub fn build(self) -> Result<Configuration, TollgateError> {
        if self.providers.is_empty() {
            return Err(TollgateError::NoProviders);
        }
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name().to_string()) {
                return Err(TollgateError::DuplicateProvider {
                    name: provider.name().to_string(),
                });
            }
        }
        Ok(Configuration {
            providers: self.providers,
            listener: self.listener,
            verifier: self.verifier,
            skip_stale_requests: self.skip_stale_requests,
            auto_recover: self.auto_recover,
        })
    }
}

/// Runtime tunables.
///
/// ## Field semantics
/// - `bus_capacity`: per-topic ring buffer of the event bus (min 1)
/// - `surface_ready_timeout`: how long a foreground flow waits for a transient
///   surface to come up before giving up
/// - `surface_finish_delay`: how long a resumed transient surface waits for a
///   result before finishing itself
///
/// Durations are written in milliseconds in JSON:
///
/// ```json
/// { "bus_capacity": 256, "surface_ready_timeout": 3000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub bus_capacity: usize,
    #[serde(with = "millis")]
    pub surface_ready_timeout: Duration,
    #[serde(with = "millis")]
    pub surface_finish_delay: Duration,
}

impl EngineSettings {
    /// Parses settings from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, TollgateError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Default for EngineSettings {
    /// - `bus_capacity = 1024`
    /// - `surface_ready_timeout = 5s`
    /// - `surface_finish_delay = 500ms`
    fn default() -> Self {
        Self {
            bus_capacity: 1024,
            surface_ready_timeout: Duration::from_secs(5),
            surface_finish_delay: Duration::from_millis(500),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
