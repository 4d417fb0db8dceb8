//! Normalized billing responses.

use serde::{Deserialize, Serialize};

use crate::request::{Purchase, RequestKind};
use crate::status::Status;

/// Result of running a purchase through the configured verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    Verified,
    Failed,
    /// No verifier configured, or nothing to verify.
    #[default]
    Skipped,
}

/// Localized product information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuDetails {
    pub sku: String,
    pub title: String,
    pub price: String,
    #[serde(default)]
    pub description: String,
}

/// Kind-specific part of a response. Mirrors [`RequestKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponsePayload {
    SkuDetails {
        details: Vec<SkuDetails>,
    },
    Inventory {
        purchases: Vec<Purchase>,
        /// More pages can be fetched with `inventory(false)`.
        has_more: bool,
        verification: Verification,
    },
    Purchase {
        sku: String,
        purchase: Option<Purchase>,
        verification: Verification,
    },
    Consume {
        purchase: Purchase,
    },
}

/// A provider's answer to one request, or one the engine made up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingResponse {
    pub status: Status,
    /// Name of the provider that answered; `None` when synthesized without one.
    pub provider: Option<String>,
    pub payload: ResponsePayload,
}

impl BillingResponse {
    /// An answer carrying only a status, shaped after `kind`.
    pub fn empty(kind: &RequestKind, status: Status) -> Self {
        let payload = match kind {
            RequestKind::SkuDetails { .. } => ResponsePayload::SkuDetails {
                details: Vec::new(),
            },
            RequestKind::Inventory { .. } => ResponsePayload::Inventory {
                purchases: Vec::new(),
                has_more: false,
                verification: Verification::Skipped,
            },
            RequestKind::Purchase { sku } => ResponsePayload::Purchase {
                sku: sku.clone(),
                purchase: None,
                verification: Verification::Skipped,
            },
            RequestKind::Consume { purchase } => ResponsePayload::Consume {
                purchase: purchase.clone(),
            },
        };
        Self {
            status,
            provider: None,
            payload,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn sku_details(status: Status, details: Vec<SkuDetails>) -> Self {
        Self {
            status,
            provider: None,
            payload: ResponsePayload::SkuDetails { details },
        }
    }

    pub fn inventory(status: Status, purchases: Vec<Purchase>, has_more: bool) -> Self {
        Self {
            status,
            provider: None,
            payload: ResponsePayload::Inventory {
                purchases,
                has_more,
                verification: Verification::Skipped,
            },
        }
    }

    pub fn purchase(status: Status, sku: impl Into<String>, purchase: Option<Purchase>) -> Self {
        Self {
            status,
            provider: None,
            payload: ResponsePayload::Purchase {
                sku: sku.into(),
                purchase,
                verification: Verification::Skipped,
            },
        }
    }

    pub fn consume(status: Status, purchase: Purchase) -> Self {
        Self {
            status,
            provider: None,
            payload: ResponsePayload::Consume { purchase },
        }
    }

    /// The verification outcome, for purchase and inventory responses.
    pub fn verification(&self) -> Option<Verification> {
        match &self.payload {
            ResponsePayload::Inventory { verification, .. }
            | ResponsePayload::Purchase { verification, .. } => Some(*verification),
            _ => None,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self.payload {
            ResponsePayload::SkuDetails { .. } => "sku_details",
            ResponsePayload::Inventory { .. } => "inventory",
            ResponsePayload::Purchase { .. } => "purchase",
            ResponsePayload::Consume { .. } => "consume",
        }
    }
}
