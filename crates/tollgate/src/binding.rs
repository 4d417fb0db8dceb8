//! Ties the active provider to the bus.
//!
//! A [`ProviderBinding`] owns one task that takes [`DispatchedRequest`]s for
//! its provider, runs them one at a time and publishes a [`ResponseEvent`]
//! followed by a [`RequestHandledEvent`] for each.
//!
//! Unbinding never interrupts a request that has started. The task finishes
//! it, answers anything already dispatched to it, then exits and unregisters
//! the provider.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::bus::{EventBus, Subscription};
use crate::events::{DispatchedRequest, RequestHandledEvent, ResponseEvent};
use crate::provider::{BillingProvider, ProviderContext, PurchaseVerifier};
use crate::response::{BillingResponse, ResponsePayload, Verification};
use crate::status::Status;

pub(crate) struct ProviderBinding {
    name: String,
    epoch: u64,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl ProviderBinding {
    /// Registers `provider` and starts its request task.
    pub(crate) fn bind(
        provider: Arc<dyn BillingProvider>,
        epoch: u64,
        bus: EventBus,
        verifier: Option<Arc<dyn PurchaseVerifier>>,
    ) -> Self {
        let name = provider.name().to_string();
        provider.register_for_events(&bus);
        let requests = bus.subscribe::<DispatchedRequest>();
        let shutdown = Arc::new(Notify::new());

        let handle = tokio::spawn(run(
            provider,
            epoch,
            requests,
            bus,
            verifier,
            Arc::clone(&shutdown),
        ));
        info!(provider = %name, epoch, "provider bound");

        Self {
            name,
            epoch,
            shutdown,
            handle,
        }
    }

    pub(crate) fn provider_name(&self) -> &str {
        &self.name
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Asks the task to stop after the request it is handling, if any.
    pub(crate) fn unbind(self) -> JoinHandle<()> {
        debug!(provider = %self.name, epoch = self.epoch, "unbinding provider");
        self.shutdown.notify_one();
        self.handle
    }
}

async fn run(
    provider: Arc<dyn BillingProvider>,
    epoch: u64,
    mut requests: Subscription<DispatchedRequest>,
    bus: EventBus,
    verifier: Option<Arc<dyn PurchaseVerifier>>,
    shutdown: Arc<Notify>,
) {
    loop {
        let dispatched = tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            next = requests.recv() => match next {
                Some(dispatched) => dispatched,
                None => break,
            },
        };
        serve(provider.as_ref(), epoch, dispatched, &bus, verifier.as_deref()).await;
    }

    // requests dispatched before the unbind still get their answer
    while let Some(dispatched) = requests.try_recv() {
        serve(provider.as_ref(), epoch, dispatched, &bus, verifier.as_deref()).await;
    }

    provider.unregister_for_events();
    info!(provider = provider.name(), epoch, "provider unbound");
}

async fn serve(
    provider: &dyn BillingProvider,
    epoch: u64,
    dispatched: DispatchedRequest,
    bus: &EventBus,
    verifier: Option<&dyn PurchaseVerifier>,
) {
    if dispatched.provider != provider.name() || dispatched.epoch != epoch {
        return;
    }

    let response = handle(provider, &dispatched, bus, verifier).await;
    debug!(
        request_id = %dispatched.id,
        provider = provider.name(),
        status = %response.status,
        "request handled"
    );
    bus.publish(ResponseEvent::new(
        dispatched.id,
        dispatched.client,
        dispatched.epoch,
        response,
    ));
    bus.publish(RequestHandledEvent {
        request: dispatched.id,
        epoch: dispatched.epoch,
    });
}

async fn handle(
    provider: &dyn BillingProvider,
    dispatched: &DispatchedRequest,
    bus: &EventBus,
    verifier: Option<&dyn PurchaseVerifier>,
) -> BillingResponse {
    let ctx = ProviderContext::new(bus.clone(), &dispatched.request);
    let outcome = AssertUnwindSafe(provider.on_billing_request(&dispatched.request, &ctx))
        .catch_unwind()
        .await;

    let response = match outcome {
        Ok(response) => response,
        Err(_) => {
            error!(
                request_id = %dispatched.id,
                provider = provider.name(),
                kind = dispatched.request.kind().as_label(),
                "provider panicked while handling request"
            );
            BillingResponse::empty(dispatched.request.kind(), Status::UnknownError)
        }
    };

    let response = response.with_provider(provider.name());
    match verifier {
        Some(verifier) => verify(response, provider.name(), verifier),
        None => response,
    }
}

/// Records the verifier's verdict on successful purchase and inventory
/// responses. An inventory verifies only if every purchase in it does.
fn verify(mut response: BillingResponse, provider: &str, verifier: &dyn PurchaseVerifier) -> BillingResponse {
    if !response.status.is_success() {
        return response;
    }
    match &mut response.payload {
        ResponsePayload::Purchase {
            purchase: Some(purchase),
            verification,
            ..
        } => {
            *verification = verifier.verify(provider, purchase);
        }
        ResponsePayload::Inventory {
            purchases,
            verification,
            ..
        } if !purchases.is_empty() => {
            let all_verified = purchases
                .iter()
                .all(|p| verifier.verify(provider, p) == Verification::Verified);
            *verification = if all_verified {
                Verification::Verified
            } else {
                Verification::Failed
            };
        }
        _ => {}
    }
    response
}
