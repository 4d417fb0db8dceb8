//! Engine events carried on the [`EventBus`](crate::EventBus).
//!
//! | Event | Published by | Consumed by |
//! |---|---|---|
//! | [`SetupStartedEvent`] | worker | listeners, observers |
//! | [`SetupResponse`](crate::SetupResponse) | worker | listeners, observers |
//! | [`DispatchedRequest`] | worker | provider binding |
//! | [`ResponseEvent`] | provider binding | worker |
//! | [`EngineAnswerEvent`] | worker | observers |
//! | [`RequestHandledEvent`] | provider binding | worker |
//! | [`RequestDroppedEvent`] | worker | observers |
//! | [`ActivityResultRequest`](crate::ActivityResultRequest) | providers | activity monitor |
//! | [`ActivityResult`](crate::ActivityResult) | UI host | activity monitor |
//!
//! Every engine event carries the configuration `epoch` it belongs to.
//! Replacing the configuration bumps the epoch; completions from older epochs
//! are ignored.

use chrono::{DateTime, Utc};

use crate::request::{BillingRequest, ClientId, RequestId};
use crate::response::BillingResponse;

/// A provider selection cycle began.
#[derive(Debug, Clone)]
pub struct SetupStartedEvent {
    pub epoch: u64,
    pub at: DateTime<Utc>,
}

/// A request was handed to the active provider.
#[derive(Debug, Clone)]
pub struct DispatchedRequest {
    pub id: RequestId,
    pub client: ClientId,
    /// Name of the provider expected to handle it.
    pub provider: String,
    pub epoch: u64,
    pub request: BillingRequest,
    pub at: DateTime<Utc>,
}

/// A response for one request.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub request: RequestId,
    pub client: ClientId,
    pub epoch: u64,
    pub response: BillingResponse,
    pub at: DateTime<Utc>,
}

impl ResponseEvent {
    pub fn new(request: RequestId, client: ClientId, epoch: u64, response: BillingResponse) -> Self {
        Self {
            request,
            client,
            epoch,
            response,
            at: Utc::now(),
        }
    }
}

/// A response the engine made up itself: `Busy`, `NoBillingProvider`, or the
/// answer to a stale or duplicate request.
///
/// The worker hands these to listeners directly; the copy on the bus is for
/// observers only.
#[derive(Debug, Clone)]
pub struct EngineAnswerEvent(pub ResponseEvent);

/// The provider finished with a dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHandledEvent {
    pub request: RequestId,
    pub epoch: u64,
}

/// A request was dropped before dispatch because its UI was gone.
#[derive(Debug, Clone)]
pub struct RequestDroppedEvent {
    pub request: RequestId,
    pub client: ClientId,
    pub dropped: BillingRequest,
}
