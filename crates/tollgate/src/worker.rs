//! The engine worker.
//!
//! One task owns the state machine, the scheduler, the dispatcher and setup
//! coordination. Callers reach it through [`Command`]s; providers reach it
//! through the bus. Nothing in here is shared, so nothing is locked.
//!
//! ```text
//!             commands (mpsc)                      bus
//! BillingClient ──────────────► Worker ◄──── ResponseEvent / RequestHandledEvent
//! EngineHandle                    │     ◄──── SetupResponse (setup task)
//!                                 ├──► DispatchedRequest ──► ProviderBinding
//!                                 ├──► EngineAnswerEvent (observers)
//!                                 └──► listeners (EventDispatcher)
//! ```
//!
//! Responses the worker makes up go straight to the dispatcher. Only
//! provider responses come back over the bus, one per dispatched request, so
//! a burst of rejected posts cannot push them out of the worker's
//! subscription.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::binding::ProviderBinding;
use crate::bus::{EventBus, Subscription};
use crate::config::Configuration;
use crate::dispatch::{EventDispatcher, ListenerSet};
use crate::error::TollgateError;
use crate::events::{EngineAnswerEvent, RequestHandledEvent, ResponseEvent, SetupStartedEvent};
use crate::machine::{EngineState, PostOutcome, RequestMachine};
use crate::request::{BillingRequest, ClientId, RequestId};
use crate::response::BillingResponse;
use crate::scheduler::RequestScheduler;
use crate::setup::{SetupManager, SetupResponse};
use crate::status::Status;

pub(crate) enum Command {
    Attach {
        client: ClientId,
        listeners: Arc<ListenerSet>,
    },
    Detach {
        client: ClientId,
    },
    Post {
        client: ClientId,
        id: RequestId,
        request: BillingRequest,
        queue_when_busy: bool,
    },
    SetConfiguration(Configuration),
    Setup,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

enum Step {
    Command(Option<Command>),
    Response(Option<ResponseEvent>),
    Handled(Option<RequestHandledEvent>),
    Setup(Option<SetupResponse>),
}

pub(crate) struct Worker {
    bus: EventBus,
    commands: mpsc::UnboundedReceiver<Command>,
    responses: Subscription<ResponseEvent>,
    handled: Subscription<RequestHandledEvent>,
    setups: Subscription<SetupResponse>,

    machine: RequestMachine,
    scheduler: RequestScheduler,
    dispatcher: EventDispatcher,
    setup: SetupManager,
    /// Epoch of the selection cycle currently running, if any.
    setup_in_flight: Option<u64>,
    setup_rerun: bool,

    binding: Option<ProviderBinding>,
    retired: Vec<JoinHandle<()>>,
    monitor_task: JoinHandle<()>,
    state: watch::Sender<EngineState>,
    shutdown_ack: Option<oneshot::Sender<()>>,
}

impl Worker {
    /// Subscribes to the bus right away so nothing published after this
    /// returns is missed.
    pub(crate) fn new(
        bus: EventBus,
        commands: mpsc::UnboundedReceiver<Command>,
        config: Configuration,
        setup: SetupManager,
        monitor_task: JoinHandle<()>,
        state: watch::Sender<EngineState>,
    ) -> Self {
        Self {
            responses: bus.subscribe(),
            handled: bus.subscribe(),
            setups: bus.subscribe(),
            commands,
            dispatcher: EventDispatcher::new(config.listener().cloned()),
            machine: RequestMachine::new(config),
            scheduler: RequestScheduler::new(),
            setup,
            setup_in_flight: None,
            setup_rerun: false,
            binding: None,
            retired: Vec::new(),
            monitor_task,
            state,
            shutdown_ack: None,
            bus,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("billing engine started");
        loop {
            let step = tokio::select! {
                biased;
                command = self.commands.recv() => Step::Command(command),
                response = self.responses.recv() => Step::Response(response),
                handled = self.handled.recv() => Step::Handled(handled),
                setup = self.setups.recv() => Step::Setup(setup),
            };

            let outcome = match step {
                Step::Command(Some(command)) => {
                    self.on_command(command);
                    Ok(())
                }
                Step::Response(Some(event)) => {
                    self.on_response(event);
                    Ok(())
                }
                Step::Handled(Some(event)) => self.on_handled(event),
                Step::Setup(Some(response)) => {
                    self.on_setup_response(response);
                    Ok(())
                }
                Step::Command(None) => {
                    debug!("every handle dropped");
                    break;
                }
                Step::Response(None) | Step::Handled(None) | Step::Setup(None) => break,
            };

            if let Err(err) = outcome {
                error!(error = %err, kind = err.as_label(), "billing engine halted");
                break;
            }
            if self.shutdown_ack.is_some() {
                break;
            }
            self.state.send_replace(self.machine.state());
        }

        self.stop().await;
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Attach { client, listeners } => {
                debug!(%client, "client attached");
                self.dispatcher.attach(client, listeners);
            }
            Command::Detach { client } => {
                self.dispatcher.detach(client);
                let dropped = self.scheduler.drop_queue(client);
                debug!(%client, dropped = dropped.len(), "client detached");
            }
            Command::Post {
                client,
                id,
                request,
                queue_when_busy,
            } => self.on_post(client, id, request, queue_when_busy),
            Command::SetConfiguration(config) => self.set_configuration(config),
            Command::Setup => self.start_setup(),
            Command::Shutdown { done } => self.shutdown_ack = Some(done),
        }
    }

    fn on_post(&mut self, client: ClientId, id: RequestId, request: BillingRequest, queue_when_busy: bool) {
        let defer = self.machine.is_busy()
            || self.setup_in_flight.is_some()
            || self.scheduler.has_queued(client);

        if queue_when_busy && defer {
            let kind = request.kind().clone();
            if self.scheduler.schedule(client, id, request) {
                debug!(%client, request_id = %id, queued = self.scheduler.len(), "request queued");
            } else {
                warn!(%client, request_id = %id, "equal request already queued; answering busy");
                let epoch = self.machine.epoch();
                self.answer(ResponseEvent::new(
                    id,
                    client,
                    epoch,
                    BillingResponse::empty(&kind, Status::Busy),
                ));
            }
            return;
        }

        if !self.submit(client, id, request) {
            self.handle_next();
        }
    }

    /// Hands one request to the state machine. Returns `true` when it was
    /// dispatched to the provider.
    fn submit(&mut self, client: ClientId, id: RequestId, request: BillingRequest) -> bool {
        match self.machine.post_request(id, client, request) {
            PostOutcome::Dispatched(dispatched) => {
                self.dispatcher.on_request(&dispatched);
                let epoch = dispatched.epoch;
                let kind = dispatched.request.kind().clone();
                if self.bus.publish(dispatched) > 0 {
                    return true;
                }

                error!(request_id = %id, "no provider task is listening; failing request");
                let closed = self.machine.on_request_handled(&RequestHandledEvent { request: id, epoch });
                debug_assert!(matches!(closed, Ok(true)));
                self.dispatcher.release();
                self.answer(ResponseEvent::new(
                    id,
                    client,
                    epoch,
                    BillingResponse::empty(&kind, Status::NoBillingProvider),
                ));
                false
            }
            PostOutcome::Rejected(event) => {
                debug!(request_id = %id, status = %event.response.status, "request answered by the engine");
                self.answer(event);
                false
            }
            PostOutcome::Stale { dropped, answer } => {
                self.bus.publish(dropped);
                self.answer(answer);
                false
            }
        }
    }

    /// Delivers a response the engine made up. It goes to the dispatcher
    /// directly, never through the worker's own bus subscription.
    fn answer(&mut self, event: ResponseEvent) {
        self.bus.publish(EngineAnswerEvent(event.clone()));
        self.dispatcher.on_response(event, self.machine.is_busy());
    }

    /// Replays queued requests until one is dispatched or none are left.
    fn handle_next(&mut self) {
        while let Some(queued) = self.scheduler.next(self.machine.is_busy()) {
            debug!(client = %queued.client, request_id = %queued.id, "replaying queued request");
            if self.submit(queued.client, queued.id, queued.request) {
                break;
            }
        }
    }

    fn on_response(&mut self, event: ResponseEvent) {
        let recover = event.epoch == self.machine.epoch() && self.machine.should_recover(&event.response);
        self.dispatcher.on_response(event, self.machine.is_busy());
        if recover {
            warn!("active provider reports billing unavailable; selecting again");
            self.start_setup();
        }
    }

    fn on_handled(&mut self, event: RequestHandledEvent) -> Result<(), TollgateError> {
        // the response was published first; deliver it before closing the request
        while let Some(response) = self.responses.try_recv() {
            self.on_response(response);
        }
        if self.machine.on_request_handled(&event)? {
            self.dispatcher.release();
            self.handle_next();
        }
        Ok(())
    }

    fn start_setup(&mut self) {
        let epoch = self.machine.epoch();
        match self.setup_in_flight {
            Some(running) if running == epoch => {
                debug!(epoch, "selection already running");
                return;
            }
            Some(running) => {
                debug!(running, epoch, "selection for an older configuration still running");
                self.setup_rerun = true;
                return;
            }
            None => {}
        }

        self.setup_in_flight = Some(epoch);
        let started = SetupStartedEvent { epoch, at: Utc::now() };
        self.dispatcher.on_setup_started(&started);
        self.bus.publish(started);

        let manager = self.setup.clone();
        let config = self.machine.config().clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let response = match tokio::task::spawn_blocking(move || manager.run(&config)).await {
                Ok(response) => response.with_epoch(epoch),
                Err(err) => {
                    error!(error = %err, "provider selection panicked");
                    SetupResponse::failed(epoch)
                }
            };
            bus.publish(response);
        });
    }

    fn on_setup_response(&mut self, response: SetupResponse) {
        if self.setup_in_flight == Some(response.epoch) {
            self.setup_in_flight = None;
        }
        if response.epoch != self.machine.epoch() {
            debug!(response_epoch = response.epoch, "discarding selection for an older configuration");
            if std::mem::take(&mut self.setup_rerun) {
                self.start_setup();
            } else {
                self.handle_next();
            }
            return;
        }

        self.machine.on_setup_response(&response);
        self.rebind();
        self.dispatcher.on_setup_response(&response);
        self.handle_next();
    }

    /// Makes the bound provider match the state machine's.
    fn rebind(&mut self) {
        let wanted = self.machine.provider().cloned();
        let epoch = self.machine.epoch();
        let unchanged = match (&self.binding, &wanted) {
            (Some(binding), Some(provider)) => {
                binding.provider_name() == provider.name() && binding.epoch() == epoch
            }
            _ => false,
        };
        if unchanged {
            return;
        }

        if let Some(old) = self.binding.take() {
            self.retired.push(old.unbind());
        }
        if let Some(provider) = wanted {
            let verifier = self.machine.config().verifier().cloned();
            self.binding = Some(ProviderBinding::bind(provider, epoch, self.bus.clone(), verifier));
        }
        self.retired.retain(|task| !task.is_finished());
    }

    fn set_configuration(&mut self, config: Configuration) {
        let listener = config.listener().cloned();
        let epoch = self.machine.set_configuration(config);
        self.setup_rerun = false;

        self.dispatcher.release();
        self.dispatcher.set_global(listener);

        for queued in self.scheduler.drop_all_queues() {
            debug!(client = %queued.client, request_id = %queued.id, "queued request dropped by reconfiguration");
            self.answer(ResponseEvent::new(
                queued.id,
                queued.client,
                epoch,
                BillingResponse::empty(queued.request.kind(), Status::NoBillingProvider),
            ));
        }
        if let Some(binding) = self.binding.take() {
            self.retired.push(binding.unbind());
        }
        info!(epoch, "configuration replaced");
    }

    async fn stop(mut self) {
        self.commands.close();
        if let Some(binding) = self.binding.take() {
            self.retired.push(binding.unbind());
        }
        for task in self.retired.drain(..) {
            if let Err(err) = task.await {
                warn!(error = %err, "provider task ended abnormally");
            }
        }
        self.monitor_task.abort();
        self.dispatcher.release();
        self.state.send_replace(EngineState::Idle);
        info!("billing engine stopped");

        if let Some(done) = self.shutdown_ack.take() {
            let _ = done.send(());
        }
    }
}
