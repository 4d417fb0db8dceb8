//! # Foreground flow rendezvous.
//!
//! Some provider operations (a purchase dialog, an account picker) must start
//! a flow on the UI thread and wait for its result from a background task.
//! [`ActivityMonitor`] arbitrates that.
//!
//! ## Protocol
//! ```text
//! provider task                    monitor                         UI thread
//! ─────────────                    ───────                         ─────────
//! publish(ActivityResultRequest) ─► claim slot (one at a time)
//!                                   │ no live origin?
//!                                   ├─► host.start_transient_surface ─► surface_ready(ctx)
//!                                   │   (wait ≤ surface_ready_timeout)
//!                                   └─► run_on_ui(launch(ctx, code)) ─► flow starts / fails
//! result.wait() ◄──────────────────  deliver_result(code) ◄───────────── ActivityResult
//! ```
//!
//! ## Rules
//! - One outstanding rendezvous. A second request while the first is
//!   unresolved is logged and resolved to absence at once.
//! - Absence is expressed by cancelling the result reference.
//! - A transient surface goes `Created → Relayed → ResultReceived → Finished`.
//!   Once resumed without a result it finishes itself after
//!   `surface_finish_delay`.
//! - A surface reported ready after its wait timed out is finished right away.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::config::EngineSettings;
use crate::handoff::SyncedReference;
use crate::ui::{LaunchFn, UiContext, UiHost};

/// Result code of a flow that completed normally.
pub const RESULT_OK: i32 = -1;
/// Result code of a flow the user backed out of.
pub const RESULT_CANCELED: i32 = 0;

/// What a foreground flow returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityResult {
    pub request_code: i32,
    pub result_code: i32,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl ActivityResult {
    pub fn is_ok(&self) -> bool {
        self.result_code == RESULT_OK
    }
}

/// A provider's ask to run a foreground flow.
#[derive(Clone)]
pub struct ActivityResultRequest {
    /// Resolved with the flow's result, or cancelled for absence.
    pub result: SyncedReference<ActivityResult>,
    pub origin: Option<Weak<dyn UiContext>>,
    /// The origin forwards results itself; no transient surface is needed.
    pub self_delivers: bool,
    pub launch: LaunchFn,
}

/// Lifecycle of a surface the monitor started itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Created,
    /// The launch callback ran on it.
    Relayed,
    ResultReceived,
    Finished,
}

struct Transient {
    surface: Arc<dyn UiContext>,
    state: SurfaceState,
}

struct Rendezvous {
    request_code: i32,
    result: SyncedReference<ActivityResult>,
    transient: Option<Transient>,
}

#[derive(Default)]
struct MonitorState {
    current: Option<Rendezvous>,
    awaiting_surface: Option<SyncedReference<Arc<dyn UiContext>>>,
    next_code: i32,
}

struct Inner {
    state: Mutex<MonitorState>,
    host: Option<Arc<dyn UiHost>>,
    bus: EventBus,
    ready_timeout: Duration,
    finish_delay: Duration,
    runtime: Option<tokio::runtime::Handle>,
}

/// Bridges provider tasks and the UI thread. Cheap to clone.
#[derive(Clone)]
pub struct ActivityMonitor {
    inner: Arc<Inner>,
}

impl ActivityMonitor {
    pub fn new(bus: EventBus, host: Option<Arc<dyn UiHost>>, settings: &EngineSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MonitorState {
                    next_code: 1,
                    ..MonitorState::default()
                }),
                host,
                bus,
                ready_timeout: settings.surface_ready_timeout,
                finish_delay: settings.surface_finish_delay,
                runtime: tokio::runtime::Handle::try_current().ok(),
            }),
        }
    }

    /// Starts consuming [`ActivityResultRequest`] and [`ActivityResult`] events.
    ///
    /// Subscriptions are opened before this returns.
    pub fn spawn_listener(&self) -> JoinHandle<()> {
        let mut requests = self.inner.bus.subscribe::<ActivityResultRequest>();
        let mut results = self.inner.bus.subscribe::<ActivityResult>();
        let me = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = requests.recv() => match request {
                        Some(request) => {
                            let monitor = me.clone();
                            tokio::spawn(async move { monitor.handle_request(request).await });
                        }
                        None => break,
                    },
                    result = results.recv() => match result {
                        Some(result) => me.deliver_result(result),
                        None => break,
                    },
                }
            }
        })
    }

    /// Runs one rendezvous to the point where the flow was launched.
    pub async fn handle_request(&self, request: ActivityResultRequest) {
        let Some(code) = self.claim(&request.result) else {
            return;
        };

        let origin = request
            .origin
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|ctx| request.self_delivers && ctx.is_alive());

        let surface = match origin {
            Some(ctx) => ctx,
            None => match self.open_transient_surface().await {
                Some(ctx) => {
                    self.with_current(code, |current| {
                        current.transient = Some(Transient {
                            surface: Arc::clone(&ctx),
                            state: SurfaceState::Created,
                        });
                    });
                    ctx
                }
                None => {
                    self.resolve(code, None);
                    return;
                }
            },
        };

        let monitor = self.clone();
        let launch = request.launch;
        self.on_ui(move || match launch(surface.as_ref(), code) {
            Ok(()) => monitor.mark_relayed(code),
            Err(err) => {
                warn!(request_code = code, error = %err, "foreground flow failed to start");
                monitor.resolve(code, None);
            }
        });
    }

    /// Reports that the transient surface asked for is up.
    pub fn surface_ready(&self, surface: Arc<dyn UiContext>) {
        let waiting = self.lock().awaiting_surface.take();
        match waiting {
            Some(reference) if reference.set(Arc::clone(&surface)) => {}
            _ => {
                debug!("transient surface arrived with nobody waiting; finishing it");
                self.on_ui(move || surface.finish());
            }
        }
    }

    /// Reports that the transient surface came back to the foreground.
    ///
    /// If no result arrives within `surface_finish_delay`, the surface
    /// finishes itself and the pending flow resolves to absence.
    pub fn surface_resumed(&self) {
        let code = {
            let state = self.lock();
            match &state.current {
                Some(current)
                    if current
                        .transient
                        .as_ref()
                        .is_some_and(|t| t.state == SurfaceState::Relayed) =>
                {
                    current.request_code
                }
                _ => return,
            }
        };

        let monitor = self.clone();
        let delay = self.inner.finish_delay;
        let expire = async move {
            tokio::time::sleep(delay).await;
            if monitor.is_pending(code) {
                debug!(request_code = code, "transient surface saw no result; finishing");
                monitor.resolve(code, None);
            }
        };
        match &self.inner.runtime {
            Some(runtime) => {
                runtime.spawn(expire);
            }
            None => warn!("no runtime to schedule the transient surface watchdog"),
        }
    }

    /// Hands a flow's result to whoever waits for it.
    pub fn deliver_result(&self, result: ActivityResult) {
        let code = result.request_code;
        if !self.is_pending(code) {
            debug!(request_code = code, "activity result matches no pending flow");
            return;
        }
        self.resolve(code, Some(result));
    }

    /// True while a flow with `request_code` is waiting for its result.
    pub fn is_pending(&self, request_code: i32) -> bool {
        self.lock()
            .current
            .as_ref()
            .is_some_and(|c| c.request_code == request_code && !c.result.is_resolved())
    }

    /// State of the transient surface used by the current flow, if any.
    pub fn transient_state(&self) -> Option<SurfaceState> {
        self.lock()
            .current
            .as_ref()
            .and_then(|c| c.transient.as_ref())
            .map(|t| t.state)
    }

    fn claim(&self, result: &SyncedReference<ActivityResult>) -> Option<i32> {
        if result.is_resolved() {
            return None;
        }
        let mut state = self.lock();
        if let Some(current) = &state.current {
            if !current.result.is_resolved() {
                drop(state);
                warn!(
                    "foreground flow requested while another is outstanding; resolving to absence"
                );
                result.cancel();
                return None;
            }
        }
        // the previous flow was resolved elsewhere (e.g. timed out by its provider)
        let stale = state.current.take();

        let code = state.next_code;
        state.next_code = state.next_code.wrapping_add(1).max(1);
        state.current = Some(Rendezvous {
            request_code: code,
            result: result.clone(),
            transient: None,
        });
        drop(state);

        if let Some(transient) = stale.and_then(|s| s.transient) {
            self.finish_surface(transient.surface);
        }
        Some(code)
    }

    async fn open_transient_surface(&self) -> Option<Arc<dyn UiContext>> {
        let Some(host) = self.inner.host.clone() else {
            warn!("no ui host configured; cannot start a transient surface");
            return None;
        };
        let ready = SyncedReference::new();
        self.lock().awaiting_surface = Some(ready.clone());
        host.start_transient_surface(self.clone());

        match ready.wait_timeout(self.inner.ready_timeout).await {
            Ok(surface) => Some(surface),
            Err(err) => {
                let mut state = self.lock();
                if state.awaiting_surface.as_ref().is_some_and(|r| r.ptr_eq(&ready)) {
                    state.awaiting_surface = None;
                }
                warn!(error = %err, "transient surface never became ready");
                None
            }
        }
    }

    fn mark_relayed(&self, code: i32) {
        self.with_current(code, |current| {
            if let Some(transient) = current.transient.as_mut() {
                if transient.state == SurfaceState::Created {
                    transient.state = SurfaceState::Relayed;
                }
            }
        });
    }

    /// Ends the flow `code`: sets or cancels its result and finishes its
    /// transient surface.
    fn resolve(&self, code: i32, value: Option<ActivityResult>) {
        let taken = {
            let mut state = self.lock();
            match &state.current {
                Some(current) if current.request_code == code => state.current.take(),
                _ => None,
            }
        };
        let Some(mut rendezvous) = taken else {
            return;
        };

        match value {
            Some(result) => {
                if let Some(transient) = rendezvous.transient.as_mut() {
                    transient.state = SurfaceState::ResultReceived;
                }
                rendezvous.result.set(result);
            }
            None => {
                rendezvous.result.cancel();
            }
        }
        if let Some(transient) = rendezvous.transient {
            self.finish_surface(transient.surface);
        }
    }

    fn finish_surface(&self, surface: Arc<dyn UiContext>) {
        self.on_ui(move || surface.finish());
    }

    fn with_current(&self, code: i32, f: impl FnOnce(&mut Rendezvous)) {
        let mut state = self.lock();
        if let Some(current) = state.current.as_mut().filter(|c| c.request_code == code) {
            f(current);
        }
    }

    fn on_ui(&self, job: impl FnOnce() + Send + 'static) {
        match &self.inner.host {
            Some(host) => host.run_on_ui(Box::new(job)),
            None => job(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ActivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ActivityMonitor")
            .field("pending", &state.current.as_ref().map(|c| c.request_code))
            .field("awaiting_surface", &state.awaiting_surface.is_some())
            .field("has_host", &self.inner.host.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LaunchError;
    use crate::ui::launcher;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

    #[derive(Default)]
    struct Surface {
        finished: AtomicBool,
    }

    impl UiContext for Surface {
        fn is_alive(&self) -> bool {
            !self.finished.load(Ordering::SeqCst)
        }
        fn finish(&self) {
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    /// Runs UI jobs inline; surfaces come up immediately unless told otherwise.
    struct InlineHost {
        surface: Arc<Surface>,
        provide_surface: bool,
    }

    impl UiHost for InlineHost {
        fn run_on_ui(&self, job: Box<dyn FnOnce() + Send>) {
            job()
        }
        fn start_transient_surface(&self, monitor: ActivityMonitor) {
            if self.provide_surface {
                monitor.surface_ready(self.surface.clone());
            }
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            surface_ready_timeout: Duration::from_millis(40),
            surface_finish_delay: Duration::from_millis(20),
            ..EngineSettings::default()
        }
    }

    fn monitor(provide_surface: bool) -> (ActivityMonitor, Arc<Surface>) {
        let surface = Arc::new(Surface::default());
        let host = InlineHost {
            surface: surface.clone(),
            provide_surface,
        };
        let monitor = ActivityMonitor::new(EventBus::new(8), Some(Arc::new(host)), &settings());
        (monitor, surface)
    }

    fn request(launch: LaunchFn) -> ActivityResultRequest {
        ActivityResultRequest {
            result: SyncedReference::new(),
            origin: None,
            self_delivers: false,
            launch,
        }
    }

    #[tokio::test]
    async fn result_reaches_waiter_and_transient_surface_finishes() {
        let (monitor, surface) = monitor(true);
        let seen_code = Arc::new(AtomicI32::new(0));
        let seen = seen_code.clone();
        let req = request(launcher(move |_, code| {
            seen.store(code, Ordering::SeqCst);
            Ok(())
        }));
        let result = req.result.clone();

        monitor.handle_request(req).await;
        let code = seen_code.load(Ordering::SeqCst);
        assert!(monitor.is_pending(code));
        assert_eq!(monitor.transient_state(), Some(SurfaceState::Relayed));

        monitor.deliver_result(ActivityResult {
            request_code: code,
            result_code: RESULT_OK,
            data: None,
        });
        assert!(result.wait().await.unwrap().is_ok());
        assert!(surface.finished.load(Ordering::SeqCst));
        assert!(!monitor.is_pending(code));
    }

    #[tokio::test]
    async fn launch_failure_resolves_to_absence() {
        let (monitor, _surface) = monitor(true);
        let req = request(launcher(|_, _| {
            Err(LaunchError::NoHandler {
                action: "buy".into(),
            })
        }));
        let result = req.result.clone();
        monitor.handle_request(req).await;
        assert!(result.wait().await.is_err());
    }

    #[tokio::test]
    async fn surface_that_never_comes_up_times_out() {
        let (monitor, surface) = monitor(false);
        let req = request(launcher(|_, _| Ok(())));
        let result = req.result.clone();

        monitor.handle_request(req).await;
        assert!(result.is_resolved());
        assert!(result.peek().is_none());

        // late arrival is finished, not leaked
        monitor.surface_ready(surface.clone());
        assert!(surface.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn only_one_outstanding_flow() {
        let (monitor, _surface) = monitor(true);
        let first = request(launcher(|_, _| Ok(())));
        let first_result = first.result.clone();
        monitor.handle_request(first).await;

        let second = request(launcher(|_, _| Ok(())));
        let second_result = second.result.clone();
        monitor.handle_request(second).await;
        assert!(second_result.is_resolved());
        assert!(!first_result.is_resolved());

        // once the first is cancelled by its owner, the slot frees up
        first_result.cancel();
        let third = request(launcher(|_, _| Ok(())));
        let third_result = third.result.clone();
        monitor.handle_request(third).await;
        assert!(!third_result.is_resolved());
    }

    #[tokio::test]
    async fn resumed_surface_without_result_finishes_itself() {
        let (monitor, surface) = monitor(true);
        let req = request(launcher(|_, _| Ok(())));
        let result = req.result.clone();
        monitor.handle_request(req).await;

        monitor.surface_resumed();
        assert!(result.wait_timeout(Duration::from_millis(500)).await.is_err());
        assert!(surface.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn self_delivering_origin_skips_transient_surface() {
        let (monitor, transient) = monitor(true);
        let origin: Arc<dyn UiContext> = Arc::new(Surface::default());
        let mut req = request(launcher(|_, _| Ok(())));
        req.origin = Some(Arc::downgrade(&origin));
        req.self_delivers = true;

        monitor.handle_request(req).await;
        assert_eq!(monitor.transient_state(), None);
        assert!(!transient.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn unmatched_results_are_ignored() {
        let (monitor, _surface) = monitor(true);
        monitor.deliver_result(ActivityResult {
            request_code: 77,
            result_code: RESULT_CANCELED,
            data: None,
        });
        assert!(!monitor.is_pending(77));
    }
}
