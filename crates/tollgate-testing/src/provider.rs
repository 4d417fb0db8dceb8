use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tollgate::{
    launcher, BillingProvider, BillingRequest, BillingResponse, Compatibility, EventBus, LaunchError,
    ProviderContext, Purchase, RequestKind, SkuDetails, Status,
};

/// How a purchase that needed a foreground flow ended, as seen by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    Completed,
    Canceled,
    /// No result: the flow timed out, never started or was refused.
    Absent,
}

#[derive(Debug)]
struct Script {
    compatibility: Compatibility,
    status: Status,
    delay: Duration,
    jitter: Duration,
    /// Purchases run a foreground flow with this deadline.
    foreground: Option<Option<Duration>>,
    launch_fails: bool,
    permissions: Vec<String>,
    owned: Vec<Purchase>,
}

/// A provider whose behaviour is set by the test.
///
/// ```rust,ignore
/// let store = StubProvider::new("store").preferred().with_delay(Duration::from_millis(20));
/// let other = StubProvider::new("other").unavailable();
/// ```
pub struct StubProvider {
    name: String,
    available: AtomicBool,
    script: Mutex<Script>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    handled: AtomicUsize,
    registered: AtomicBool,
    requests: Mutex<Vec<RequestKind>>,
    launches: Arc<Mutex<Vec<(i32, Option<String>)>>>,
    flows: Mutex<Vec<FlowOutcome>>,
}

impl StubProvider {
    /// Available, compatible, answering `Success` without delay.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            available: AtomicBool::new(true),
            script: Mutex::new(Script {
                compatibility: Compatibility::Compatible,
                status: Status::Success,
                delay: Duration::ZERO,
                jitter: Duration::ZERO,
                foreground: None,
                launch_fails: false,
                permissions: Vec::new(),
                owned: Vec::new(),
            }),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            handled: AtomicUsize::new(0),
            registered: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            launches: Arc::new(Mutex::new(Vec::new())),
            flows: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable(self) -> Self {
        self.set_available(false);
        self
    }

    pub fn preferred(self) -> Self {
        self.with_compatibility(Compatibility::Preferred)
    }

    pub fn incompatible(self) -> Self {
        self.with_compatibility(Compatibility::Incompatible)
    }

    pub fn with_compatibility(self, compatibility: Compatibility) -> Self {
        self.script().compatibility = compatibility;
        self
    }

    pub fn replying(self, status: Status) -> Self {
        self.set_status(status);
        self
    }

    /// Every request takes at least `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.script().delay = delay;
        self
    }

    /// Adds a random extra delay of up to `jitter` to every request.
    pub fn with_jitter(self, jitter: Duration) -> Self {
        self.script().jitter = jitter;
        self
    }

    /// Purchases go through a foreground flow, waiting at most `deadline`.
    pub fn with_foreground_flow(self, deadline: Option<Duration>) -> Self {
        self.script().foreground = Some(deadline);
        self
    }

    /// The foreground flow refuses to start.
    pub fn with_failing_launch(self) -> Self {
        self.script().launch_fails = true;
        self
    }

    pub fn with_permissions<I, S>(self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script().permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    /// Purchases reported by inventory requests.
    pub fn owning(self, purchases: Vec<Purchase>) -> Self {
        self.script().owned = purchases;
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_status(&self, status: Status) {
        self.script().status = status;
    }

    /// Highest number of requests ever handled at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Requests handled so far, in order.
    pub fn requests(&self) -> Vec<RequestKind> {
        lock(&self.requests).clone()
    }

    /// Request codes of the foreground flows started, with the name of the
    /// thread each was started on.
    pub fn launches(&self) -> Vec<(i32, Option<String>)> {
        lock(&self.launches).clone()
    }

    pub fn flows(&self) -> Vec<FlowOutcome> {
        lock(&self.flows).clone()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        lock(&self.script)
    }

    async fn purchase(&self, sku: &str, ctx: &ProviderContext) -> BillingResponse {
        let (status, foreground, launch_fails) = {
            let script = self.script();
            (script.status, script.foreground, script.launch_fails)
        };
        let Some(deadline) = foreground else {
            let purchase = status
                .is_success()
                .then(|| Purchase::new(sku, format!("{}-order-{}", self.name, self.handled()), "token"));
            return BillingResponse::purchase(status, sku, purchase);
        };

        let launches = Arc::clone(&self.launches);
        let launch = launcher(move |_surface, code| {
            if launch_fails {
                return Err(LaunchError::NoHandler {
                    action: "purchase".into(),
                });
            }
            let thread = std::thread::current().name().map(str::to_string);
            lock(&launches).push((code, thread));
            Ok(())
        });

        let (outcome, response) = match ctx.launch_for_result(launch, deadline).await {
            Some(result) if result.is_ok() => (
                FlowOutcome::Completed,
                BillingResponse::purchase(
                    Status::Success,
                    sku,
                    Some(Purchase::new(sku, format!("{}-flow-{}", self.name, result.request_code), "token")),
                ),
            ),
            Some(_) => (
                FlowOutcome::Canceled,
                BillingResponse::purchase(Status::UserCanceled, sku, None),
            ),
            None => (
                FlowOutcome::Absent,
                BillingResponse::purchase(Status::UnknownError, sku, None),
            ),
        };
        lock(&self.flows).push(outcome);
        response
    }
}

#[async_trait]
impl BillingProvider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn check_compatibility(&self) -> Compatibility {
        self.script().compatibility
    }

    async fn on_billing_request(&self, request: &BillingRequest, ctx: &ProviderContext) -> BillingResponse {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        lock(&self.requests).push(request.kind().clone());

        let (status, delay, jitter) = {
            let script = self.script();
            (script.status, script.delay, script.jitter)
        };
        let extra = if jitter.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_micros(fastrand::u64(0..=jitter.as_micros() as u64))
        };
        if !(delay + extra).is_zero() {
            tokio::time::sleep(delay + extra).await;
        }

        let response = match request.kind() {
            RequestKind::Purchase { sku } => self.purchase(sku, ctx).await,
            RequestKind::Consume { purchase } => BillingResponse::consume(status, purchase.clone()),
            RequestKind::Inventory { .. } => {
                let owned = if status.is_success() {
                    self.script().owned.clone()
                } else {
                    Vec::new()
                };
                BillingResponse::inventory(status, owned, false)
            }
            RequestKind::SkuDetails { skus } => BillingResponse::sku_details(
                status,
                skus.iter()
                    .map(|sku| SkuDetails {
                        sku: sku.clone(),
                        title: sku.to_uppercase(),
                        price: "0.99".into(),
                        description: String::new(),
                    })
                    .collect(),
            ),
        };

        self.handled.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
        response
    }

    fn permissions(&self) -> Option<Vec<String>> {
        let permissions = self.script().permissions.clone();
        (!permissions.is_empty()).then_some(permissions)
    }

    fn register_for_events(&self, _bus: &EventBus) {
        self.registered.store(true, Ordering::SeqCst);
    }

    fn unregister_for_events(&self) {
        self.registered.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for StubProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubProvider")
            .field("name", &self.name)
            .field("available", &self.is_available())
            .field("handled", &self.handled())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
