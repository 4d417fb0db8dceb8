//! # Request/response state machine.
//!
//! [`RequestMachine`] owns the two facts the whole engine hinges on: the
//! current provider and the one pending request.
//!
//! ```text
//!            on_setup_response(ok)          post_request
//!   ┌──────┐ ─────────────────────► ┌───────┐ ───────────► ┌──────┐
//!   │ Idle │                        │ Ready │              │ Busy │
//!   └──────┘ ◄───────────────────── └───────┘ ◄─────────── └──────┘
//!        set_configuration / setup failed     request handled
//! ```
//!
//! ## Rules
//! - At most one pending request, globally.
//! - Nothing here fails with an error for operational problems: a busy engine
//!   or a missing provider produce synthesized responses.
//! - A completion for anything but the pending request (same epoch) is a
//!   broken invariant and surfaces as [`TollgateError::UnexpectedCompletion`].

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::Configuration;
use crate::error::TollgateError;
use crate::events::{DispatchedRequest, RequestDroppedEvent, RequestHandledEvent, ResponseEvent};
use crate::provider::BillingProvider;
use crate::request::{BillingRequest, ClientId, RequestId};
use crate::response::BillingResponse;
use crate::setup::SetupResponse;
use crate::status::Status;

/// Coarse engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No provider selected.
    Idle,
    /// Provider selected, nothing in flight.
    Ready,
    /// A request is in flight.
    Busy,
}

/// What happened to a posted request.
#[derive(Debug)]
pub enum PostOutcome {
    /// Recorded as pending; publish it for the provider.
    Dispatched(DispatchedRequest),
    /// Answered on the spot with a synthesized response.
    Rejected(ResponseEvent),
    /// Dropped because its UI is gone; nothing was dispatched. The caller
    /// still gets `answer`, an `UnknownError` response.
    Stale {
        dropped: RequestDroppedEvent,
        answer: ResponseEvent,
    },
}

#[derive(Debug)]
struct Pending {
    id: RequestId,
    client: ClientId,
}

/// Single-flight state machine.
pub struct RequestMachine {
    config: Configuration,
    epoch: u64,
    provider: Option<Arc<dyn BillingProvider>>,
    last_setup_ok: bool,
    pending: Option<Pending>,
}

impl RequestMachine {
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            epoch: 0,
            provider: None,
            last_setup_ok: false,
            pending: None,
        }
    }

    /// Replaces the configuration and resets to `Idle`. Returns the new epoch.
    pub fn set_configuration(&mut self, config: Configuration) -> u64 {
        if let Some(pending) = self.pending.take() {
            debug!(request_id = %pending.id, "pending request abandoned by reconfiguration");
        }
        self.config = config;
        self.provider = None;
        self.last_setup_ok = false;
        self.epoch += 1;
        self.epoch
    }

    /// Records the outcome of a selection cycle.
    pub fn on_setup_response(&mut self, response: &SetupResponse) {
        if response.epoch != self.epoch {
            debug!(
                response_epoch = response.epoch,
                epoch = self.epoch,
                "ignoring setup response from an older configuration"
            );
            return;
        }
        self.last_setup_ok = response.is_success();
        self.provider = if self.last_setup_ok {
            response.provider.clone()
        } else {
            None
        };
    }

    /// Accepts, rejects or drops one request.
    pub fn post_request(&mut self, id: RequestId, client: ClientId, request: BillingRequest) -> PostOutcome {
        if let Some(pending) = &self.pending {
            debug!(request_id = %id, pending = %pending.id, "engine busy");
            return self.reject(id, client, &request, Status::Busy);
        }

        let provider = match (&self.provider, self.last_setup_ok) {
            (Some(provider), true) => provider.name().to_string(),
            _ => return self.reject(id, client, &request, Status::NoBillingProvider),
        };

        if self.config.skip_stale_requests() && request.is_stale() {
            warn!(request_id = %id, %client, kind = request.kind().as_label(), "dropping stale request");
            let answer = ResponseEvent::new(
                id,
                client,
                self.epoch,
                BillingResponse::empty(request.kind(), Status::UnknownError),
            );
            return PostOutcome::Stale {
                dropped: RequestDroppedEvent {
                    request: id,
                    client,
                    dropped: request,
                },
                answer,
            };
        }

        self.pending = Some(Pending { id, client });
        debug!(request_id = %id, %client, provider = %provider, "request dispatched");
        PostOutcome::Dispatched(DispatchedRequest {
            id,
            client,
            provider,
            epoch: self.epoch,
            request,
            at: Utc::now(),
        })
    }

    /// Clears the pending request. Returns `Ok(false)` for completions that
    /// belong to an older configuration.
    pub fn on_request_handled(&mut self, handled: &RequestHandledEvent) -> Result<bool, TollgateError> {
        if handled.epoch != self.epoch {
            debug!(request_id = %handled.request, "completion from an older configuration");
            return Ok(false);
        }
        match &self.pending {
            Some(pending) if pending.id == handled.request => {
                self.pending = None;
                Ok(true)
            }
            other => Err(TollgateError::UnexpectedCompletion {
                handled: handled.request,
                pending: other.as_ref().map(|p| p.id),
            }),
        }
    }

    /// True when `response` should trigger a fresh selection cycle.
    pub fn should_recover(&self, response: &BillingResponse) -> bool {
        response.status == Status::BillingUnavailable && self.config.auto_recover() && self.last_setup_ok
    }

    pub fn state(&self) -> EngineState {
        if self.pending.is_some() {
            EngineState::Busy
        } else if self.provider.is_some() {
            EngineState::Ready
        } else {
            EngineState::Idle
        }
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_client(&self) -> Option<ClientId> {
        self.pending.as_ref().map(|p| p.client)
    }

    pub fn provider(&self) -> Option<&Arc<dyn BillingProvider>> {
        self.provider.as_ref()
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn reject(&self, id: RequestId, client: ClientId, request: &BillingRequest, status: Status) -> PostOutcome {
        PostOutcome::Rejected(ResponseEvent::new(
            id,
            client,
            self.epoch,
            BillingResponse::empty(request.kind(), status),
        ))
    }
}
