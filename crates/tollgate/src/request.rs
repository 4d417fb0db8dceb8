//! Billing requests and the identifiers that follow them through the engine.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ui::{self, UiContext};

/// Identifies one dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies an attached [`BillingClient`](crate::BillingClient).
///
/// Ids grow monotonically in attach order, which gives the scheduler its
/// stable iteration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub(crate) u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// A purchase owned by the user, as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Purchase {
    pub sku: String,
    pub order_id: String,
    pub token: String,
    /// Raw vendor receipt, handed to the verifier untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
}

impl Purchase {
    pub fn new(sku: impl Into<String>, order_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            sku: sku.into(),
            order_id: order_id.into(),
            token: token.into(),
            receipt: None,
        }
    }

    pub fn with_receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = Some(receipt.into());
        self
    }
}

/// The logical billing operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestKind {
    SkuDetails { skus: BTreeSet<String> },
    Inventory { start_over: bool },
    Purchase { sku: String },
    Consume { purchase: Purchase },
}

impl RequestKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            RequestKind::SkuDetails { .. } => "sku_details",
            RequestKind::Inventory { .. } => "inventory",
            RequestKind::Purchase { .. } => "purchase",
            RequestKind::Consume { .. } => "consume",
        }
    }
}

/// One billing operation plus a non-owning link to the UI that asked for it.
///
/// Equality compares the operation only: two requests for the same SKU from
/// different screens are the same request.
#[derive(Clone)]
pub struct BillingRequest {
    kind: RequestKind,
    origin: Option<Weak<dyn UiContext>>,
    self_delivers: bool,
}

impl BillingRequest {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            origin: None,
            self_delivers: false,
        }
    }

    pub fn purchase(sku: impl Into<String>) -> Self {
        Self::new(RequestKind::Purchase { sku: sku.into() })
    }

    pub fn consume(purchase: Purchase) -> Self {
        Self::new(RequestKind::Consume { purchase })
    }

    pub fn inventory(start_over: bool) -> Self {
        Self::new(RequestKind::Inventory { start_over })
    }

    pub fn sku_details<I, S>(skus: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(RequestKind::SkuDetails {
            skus: skus.into_iter().map(Into::into).collect(),
        })
    }

    /// Links the request to the UI surface that issued it.
    ///
    /// `self_delivers` says the surface forwards activity results itself, so
    /// no transient surface is needed for foreground flows.
    pub fn with_origin(mut self, origin: &Arc<dyn UiContext>, self_delivers: bool) -> Self {
        self.origin = Some(Arc::downgrade(origin));
        self.self_delivers = self_delivers;
        self
    }

    pub(crate) fn with_weak_origin(
        mut self,
        origin: Option<Weak<dyn UiContext>>,
        self_delivers: bool,
    ) -> Self {
        self.origin = origin;
        self.self_delivers = self_delivers;
        self
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    /// The originating surface, if it still exists.
    pub fn origin(&self) -> Option<Arc<dyn UiContext>> {
        self.origin.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn origin_weak(&self) -> Option<Weak<dyn UiContext>> {
        self.origin.clone()
    }

    pub fn self_delivers(&self) -> bool {
        self.self_delivers
    }

    /// True when the request has an origin that is gone or in the background.
    pub fn is_stale(&self) -> bool {
        !ui::is_live(&self.origin)
    }
}

impl PartialEq for BillingRequest {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for BillingRequest {}

impl fmt::Debug for BillingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BillingRequest")
            .field("kind", &self.kind)
            .field("has_origin", &self.origin.is_some())
            .field("self_delivers", &self.self_delivers)
            .finish()
    }
}
