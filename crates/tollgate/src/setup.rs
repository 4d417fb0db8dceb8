//! # Provider selection.
//!
//! [`SetupManager`] picks exactly one provider out of a configuration.
//!
//! ## Ranking
//! ```text
//! configured providers
//!     │ is_available()
//!     ▼
//! available ──► prior winner still available and not Incompatible? ──► it (Success)
//!     │ no
//!     ▼
//! first Preferred ─► else first Compatible ─► else Failed
//! (ProviderChanged instead of Success when a prior winner was rejected)
//! ```
//!
//! ## Rules
//! - Stability beats optimality: a usable prior winner is kept even when a
//!   `Preferred` provider exists.
//! - Same inputs, same answer: configured order breaks every tie.
//! - `Failed` is final for the cycle; nothing retries automatically.
//! - The winner's name is persisted before the result is returned.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::provider::{BillingProvider, Compatibility};
use crate::store::{PreferenceStore, LAST_PROVIDER_KEY};

/// Outcome class of a selection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupStatus {
    /// A provider was picked; it is the one picked last time, or there was none.
    Success,
    /// A provider was picked, replacing the previous winner.
    ProviderChanged,
    /// No configured provider is usable.
    Failed,
}

impl SetupStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, SetupStatus::Failed)
    }
}

/// Result of one selection cycle. Also published on the bus.
#[derive(Clone)]
pub struct SetupResponse {
    pub status: SetupStatus,
    pub provider: Option<Arc<dyn BillingProvider>>,
    pub epoch: u64,
    pub at: DateTime<Utc>,
}

impl SetupResponse {
    fn new(status: SetupStatus, provider: Option<Arc<dyn BillingProvider>>) -> Self {
        Self {
            status,
            provider,
            epoch: 0,
            at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success() && self.provider.is_some()
    }

    pub fn provider_name(&self) -> Option<&str> {
        self.provider.as_ref().map(|p| p.name())
    }

    /// A `Failed` response for a cycle that could not run to completion.
    pub(crate) fn failed(epoch: u64) -> Self {
        Self::new(SetupStatus::Failed, None).with_epoch(epoch)
    }

    pub(crate) fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }
}

impl fmt::Debug for SetupResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupResponse")
            .field("status", &self.status)
            .field("provider", &self.provider_name())
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Ranks providers and remembers the winner.
#[derive(Clone)]
pub struct SetupManager {
    store: Arc<dyn PreferenceStore>,
}

impl SetupManager {
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        Self { store }
    }

    /// Runs one full cycle for `config`: read the prior winner, select, persist.
    ///
    /// Blocking: it calls every provider's availability check.
    pub fn run(&self, config: &Configuration) -> SetupResponse {
        let prior = self.store.get(LAST_PROVIDER_KEY);
        let response = Self::select(config.providers(), prior.as_deref());

        match response.provider_name() {
            Some(name) => {
                self.store.put(LAST_PROVIDER_KEY, name);
                info!(provider = name, status = ?response.status, "billing provider selected");
            }
            None => warn!(prior = ?prior, "no usable billing provider"),
        }
        response
    }

    /// Pure ranking step. `prior` is the previously persisted winner, if any.
    pub fn select(providers: &[Arc<dyn BillingProvider>], prior: Option<&str>) -> SetupResponse {
        let available: Vec<&Arc<dyn BillingProvider>> =
            providers.iter().filter(|p| p.is_available()).collect();
        debug!(
            configured = providers.len(),
            available = available.len(),
            "ranking billing providers"
        );

        if let Some(prior) = prior {
            let kept = available
                .iter()
                .find(|p| p.name() == prior)
                .filter(|p| p.check_compatibility() != Compatibility::Incompatible);
            if let Some(provider) = kept {
                return SetupResponse::new(SetupStatus::Success, Some(Arc::clone(*provider)));
            }
        }

        let scored: Vec<(&Arc<dyn BillingProvider>, Compatibility)> = available
            .into_iter()
            .map(|p| (p, p.check_compatibility()))
            .collect();
        let winner = scored
            .iter()
            .find(|(_, c)| *c == Compatibility::Preferred)
            .or_else(|| scored.iter().find(|(_, c)| *c == Compatibility::Compatible))
            .map(|(p, _)| Arc::clone(*p));

        match winner {
            Some(provider) if prior.is_some() => {
                SetupResponse::new(SetupStatus::ProviderChanged, Some(provider))
            }
            Some(provider) => SetupResponse::new(SetupStatus::Success, Some(provider)),
            None => SetupResponse::new(SetupStatus::Failed, None),
        }
    }
}

impl fmt::Debug for SetupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupManager").finish_non_exhaustive()
    }
}
