use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Result};
use tollgate::{BillingResponse, Listener, SetupStatus, Status};

use crate::eventually;

/// One callback invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    SetupStarted { epoch: u64 },
    Setup { status: SetupStatus, provider: Option<String> },
    Request { kind: &'static str },
    Response(BillingResponse),
}

/// Captures every callback of the listener it hands out. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    log: Arc<Mutex<Vec<Recorded>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A listener feeding this recorder. Responses are recorded once, through
    /// their kind-specific callback.
    pub fn listener(&self) -> Listener {
        let started = self.clone();
        let setup = self.clone();
        let request = self.clone();
        let (purchase, inventory, consume, details) = (self.clone(), self.clone(), self.clone(), self.clone());

        Listener::new()
            .on_setup_started(move |event| started.push(Recorded::SetupStarted { epoch: event.epoch }))
            .on_setup_response(move |response| {
                setup.push(Recorded::Setup {
                    status: response.status,
                    provider: response.provider_name().map(str::to_string),
                })
            })
            .on_request(move |req| {
                request.push(Recorded::Request {
                    kind: req.kind().as_label(),
                })
            })
            .on_purchase(move |r| purchase.push(Recorded::Response(r.clone())))
            .on_inventory(move |r| inventory.push(Recorded::Response(r.clone())))
            .on_consume(move |r| consume.push(Recorded::Response(r.clone())))
            .on_sku_details(move |r| details.push(Recorded::Response(r.clone())))
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.lock().clone()
    }

    pub fn responses(&self) -> Vec<BillingResponse> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::Response(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.responses().iter().map(|r| r.status).collect()
    }

    pub fn setups(&self) -> Vec<(SetupStatus, Option<String>)> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::Setup { status, provider } => Some((*status, provider.clone())),
                _ => None,
            })
            .collect()
    }

    /// Waits until at least `count` responses were recorded.
    pub async fn wait_for_responses(&self, count: usize, timeout: Duration) -> Result<Vec<BillingResponse>> {
        if !eventually(timeout, || self.responses().len() >= count).await {
            bail!(
                "expected {count} responses within {timeout:?}, got {:?}",
                self.statuses()
            );
        }
        Ok(self.responses())
    }

    /// Waits for the next setup outcome after the `already_seen` first ones.
    pub async fn wait_for_setup(
        &self,
        already_seen: usize,
        timeout: Duration,
    ) -> Result<(SetupStatus, Option<String>)> {
        if !eventually(timeout, || self.setups().len() > already_seen).await {
            bail!("no setup response within {timeout:?}");
        }
        Ok(self.setups()[already_seen].clone())
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn push(&self, event: Recorded) {
        self.lock().push(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Recorded>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
