//! # Purchase Flow Demo
//!
//! Runs the engine end to end against two providers: one that is switched
//! off, and one that opens a (simulated) checkout screen for purchases.
//! The chosen provider is remembered in a JSON file between runs.
//!
//! ```text
//! RUST_LOG=tollgate=debug cargo run -p purchase-flow-demo
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tollgate::{
    launcher, ActivityResult, BillingProvider, BillingRequest, BillingResponse, Compatibility,
    Configuration, Engine, EngineState, Listener, ProviderContext, ProviderTable, Purchase, RequestKind,
    ResponsePayload, SkuDetails, Status, UiHost, RESULT_OK,
};
use tollgate_persistence::FilePreferenceStore;
use tollgate_testing::{eventually, StubProvider, ThreadUiHost};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Provider
// ============================================================================

/// A storefront whose checkout screen accepts every purchase at once.
struct DemoStore;

#[async_trait]
impl BillingProvider for DemoStore {
    fn name(&self) -> &str {
        "demo-store"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn check_compatibility(&self) -> Compatibility {
        Compatibility::Preferred
    }

    async fn on_billing_request(&self, request: &BillingRequest, ctx: &ProviderContext) -> BillingResponse {
        match request.kind() {
            RequestKind::SkuDetails { skus } => BillingResponse::sku_details(
                Status::Success,
                skus.iter()
                    .map(|sku| SkuDetails {
                        sku: sku.clone(),
                        title: format!("{sku} pack"),
                        price: "$1.99".into(),
                        description: String::new(),
                    })
                    .collect(),
            ),
            RequestKind::Purchase { sku } => {
                // the checkout screen reports back over the bus right away
                let bus = ctx.bus().clone();
                let checkout = launcher(move |_surface, code| {
                    bus.publish(ActivityResult {
                        request_code: code,
                        result_code: RESULT_OK,
                        data: None,
                    });
                    Ok(())
                });
                match ctx.launch_for_result(checkout, Some(Duration::from_secs(5))).await {
                    Some(result) if result.is_ok() => BillingResponse::purchase(
                        Status::Success,
                        sku,
                        Some(Purchase::new(sku, format!("order-{}", result.request_code), "demo-token")),
                    ),
                    Some(_) => BillingResponse::purchase(Status::UserCanceled, sku, None),
                    None => BillingResponse::purchase(Status::UnknownError, sku, None),
                }
            }
            RequestKind::Inventory { .. } => BillingResponse::inventory(Status::Success, Vec::new(), false),
            RequestKind::Consume { purchase } => BillingResponse::consume(Status::Success, purchase.clone()),
        }
    }
}

// ============================================================================
// Listener
// ============================================================================

fn printer() -> Listener {
    Listener::new()
        .on_setup_response(|setup| {
            println!("setup: {:?} -> {:?}", setup.status, setup.provider_name());
        })
        .on_response(|response| match &response.payload {
            ResponsePayload::SkuDetails { details } => {
                for d in details {
                    println!("  {} {} ({})", d.sku, d.price, d.title);
                }
            }
            ResponsePayload::Purchase { sku, purchase, .. } => {
                println!("purchase {sku}: {} {:?}", response.status, purchase.as_ref().map(|p| &p.order_id));
            }
            other => println!("{}: {:?}", response.status, other),
        })
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let table = ProviderTable::new()
        .register("demo-store", || Arc::new(DemoStore))
        .register("offline", || Arc::new(StubProvider::new("offline").unavailable()));

    let config = Configuration::builder()
        .providers_from(&table, ["offline", "demo-store"])?
        .listener(printer())
        .auto_recover(true)
        .build()?;

    let prefs = std::env::temp_dir().join("tollgate-demo").join("prefs.json");
    let store = FilePreferenceStore::open_or_reset(&prefs)?;
    let host = ThreadUiHost::new();

    let engine = Engine::builder(config)
        .with_store(Arc::new(store))
        .with_ui_host(Arc::clone(&host) as Arc<dyn UiHost>)
        .start();

    engine.setup()?;
    if !eventually(Duration::from_secs(5), || engine.state() == EngineState::Ready).await {
        bail!("no billing provider became ready");
    }

    let answered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&answered);
    let client = engine.attach(None)?;
    client.add_listener(Listener::new().on_response(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    client.sku_details(["gems", "coins"])?;
    client.purchase("gems")?;
    client.inventory(true)?;

    if !eventually(Duration::from_secs(10), || answered.load(Ordering::SeqCst) == 3).await {
        bail!("requests did not finish in time");
    }

    drop(client);
    engine.shutdown().await?;
    host.stop();
    info!(prefs = %prefs.display(), "preference file written");

    Ok(())
}
