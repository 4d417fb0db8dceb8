use std::sync::Arc;
use std::time::Duration;

use tollgate::{
    BillingProvider, Configuration, EngineAnswerEvent, Engine, EngineHandle, EngineSettings, EngineState,
    Listener, MemoryStore, PreferenceStore, Purchase, PurchaseVerifier, RequestDroppedEvent, SetupStatus,
    Status, TollgateError, Verification, LAST_PROVIDER_KEY,
};
use tollgate_testing::{eventually, Recorder, StubProvider, TestSurface};

const WAIT: Duration = Duration::from_secs(5);

fn stub(provider: StubProvider) -> Arc<StubProvider> {
    Arc::new(provider)
}

fn config(providers: &[&Arc<StubProvider>], recorder: &Recorder) -> tollgate::ConfigurationBuilder {
    providers
        .iter()
        .fold(Configuration::builder(), |builder, p| {
            builder.provider(Arc::clone(*p) as Arc<dyn BillingProvider>)
        })
        .listener(recorder.listener())
}

async fn ready(engine: &EngineHandle) {
    engine.setup().unwrap();
    assert!(
        eventually(WAIT, || engine.state() == EngineState::Ready).await,
        "engine never became ready"
    );
}

#[tokio::test]
async fn purchase_round_trip() {
    let store = MemoryStore::new();
    let provider = stub(StubProvider::new("store").preferred());
    let global = Recorder::new();
    let engine = Engine::builder(config(&[&provider], &global).build().unwrap())
        .with_store(Arc::new(store.clone()))
        .start();
    ready(&engine).await;

    let mine = Recorder::new();
    let client = engine.attach(None).unwrap();
    client.add_listener(mine.listener());
    client.purchase("gem").unwrap();

    let responses = mine.wait_for_responses(1, WAIT).await.unwrap();
    assert_eq!(responses[0].status, Status::Success);
    assert_eq!(responses[0].provider.as_deref(), Some("store"));
    assert_eq!(global.statuses(), vec![Status::Success]);
    assert_eq!(global.setups(), vec![(SetupStatus::Success, Some("store".to_string()))]);
    assert_eq!(store.get(LAST_PROVIDER_KEY).as_deref(), Some("store"));
    assert!(provider.is_registered());
}

#[tokio::test]
async fn requests_before_setup_get_no_billing_provider() {
    let provider = stub(StubProvider::new("store"));
    let recorder = Recorder::new();
    let engine = Engine::builder(config(&[&provider], &recorder).build().unwrap()).start();

    let client = engine.attach(None).unwrap();
    client.inventory(true).unwrap();

    assert_eq!(
        recorder.wait_for_responses(1, WAIT).await.unwrap()[0].status,
        Status::NoBillingProvider
    );
    assert_eq!(provider.handled(), 0);
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn failed_selection_leaves_engine_without_provider() {
    let a = stub(StubProvider::new("a").unavailable());
    let b = stub(StubProvider::new("b").incompatible());
    let recorder = Recorder::new();
    let engine = Engine::builder(config(&[&a, &b], &recorder).build().unwrap()).start();

    engine.setup().unwrap();
    assert_eq!(
        recorder.wait_for_setup(0, WAIT).await.unwrap(),
        (SetupStatus::Failed, None)
    );

    let client = engine.attach(None).unwrap();
    client.purchase("gem").unwrap();
    assert_eq!(
        recorder.wait_for_responses(1, WAIT).await.unwrap()[0].status,
        Status::NoBillingProvider
    );
}

#[tokio::test]
async fn busy_engine_rejects_or_queues() {
    let provider = stub(StubProvider::new("store").with_delay(Duration::from_millis(150)));
    let recorder = Recorder::new();
    let engine = Engine::builder(config(&[&provider], &recorder).build().unwrap()).start();
    ready(&engine).await;

    let (rec_a, rec_b, rec_c) = (Recorder::new(), Recorder::new(), Recorder::new());
    let a = engine.attach(None).unwrap();
    let b = engine.attach(None).unwrap().queue_when_busy(false);
    let c = engine.attach(None).unwrap();
    a.add_listener(rec_a.listener());
    b.add_listener(rec_b.listener());
    c.add_listener(rec_c.listener());

    a.purchase("first").unwrap();
    assert!(eventually(WAIT, || engine.state() == EngineState::Busy).await);
    b.purchase("second").unwrap();
    c.purchase("third").unwrap();

    assert_eq!(rec_b.wait_for_responses(1, WAIT).await.unwrap()[0].status, Status::Busy);
    assert_eq!(rec_a.wait_for_responses(1, WAIT).await.unwrap()[0].status, Status::Success);
    assert_eq!(rec_c.wait_for_responses(1, WAIT).await.unwrap()[0].status, Status::Success);

    assert_eq!(provider.max_concurrent(), 1);
    assert_eq!(
        provider.requests(),
        vec![
            tollgate::RequestKind::Purchase { sku: "first".into() },
            tollgate::RequestKind::Purchase { sku: "third".into() },
        ]
    );
    assert!(eventually(WAIT, || engine.state() == EngineState::Ready).await);
}

#[tokio::test]
async fn held_back_responses_follow_completion_order() {
    let provider = stub(StubProvider::new("store").with_delay(Duration::from_millis(100)));
    let recorder = Recorder::new();
    let engine = Engine::builder(config(&[&provider], &recorder).build().unwrap()).start();
    ready(&engine).await;

    let a = engine.attach(None).unwrap();
    let b = engine.attach(None).unwrap().queue_when_busy(false);
    a.purchase("slow").unwrap();
    assert!(eventually(WAIT, || engine.state() == EngineState::Busy).await);
    b.inventory(true).unwrap();

    // both answers are held until the purchase completes, then released in arrival order
    let statuses: Vec<Status> = recorder
        .wait_for_responses(2, WAIT)
        .await
        .unwrap()
        .iter()
        .map(|r| r.status)
        .collect();
    assert_eq!(statuses, vec![Status::Busy, Status::Success]);
}

#[tokio::test]
async fn billing_unavailable_triggers_new_selection() {
    let primary = stub(StubProvider::new("primary").preferred());
    let backup = stub(StubProvider::new("backup"));
    let recorder = Recorder::new();
    let engine = Engine::builder(
        config(&[&primary, &backup], &recorder)
            .auto_recover(true)
            .build()
            .unwrap(),
    )
    .start();
    ready(&engine).await;
    assert!(primary.is_registered());

    primary.set_status(Status::BillingUnavailable);
    primary.set_available(false);

    let client = engine.attach(None).unwrap();
    client.inventory(true).unwrap();
    assert_eq!(
        recorder.wait_for_responses(1, WAIT).await.unwrap()[0].status,
        Status::BillingUnavailable
    );
    assert_eq!(
        recorder.wait_for_setup(1, WAIT).await.unwrap(),
        (SetupStatus::ProviderChanged, Some("backup".to_string()))
    );

    client.inventory(false).unwrap();
    let responses = recorder.wait_for_responses(2, WAIT).await.unwrap();
    assert_eq!(responses[1].status, Status::Success);
    assert_eq!(responses[1].provider.as_deref(), Some("backup"));
    assert!(eventually(WAIT, || !primary.is_registered() && backup.is_registered()).await);
}

#[tokio::test]
async fn setup_requests_coalesce() {
    let provider = stub(StubProvider::new("store"));
    let recorder = Recorder::new();
    let engine = Engine::builder(config(&[&provider], &recorder).build().unwrap()).start();

    engine.setup().unwrap();
    engine.setup().unwrap();
    engine.setup().unwrap();
    ready(&engine).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = recorder
        .events()
        .iter()
        .filter(|e| matches!(e, tollgate_testing::Recorded::SetupStarted { .. }))
        .count();
    assert_eq!(started, 1);
    assert_eq!(recorder.setups().len(), 1);
}

#[tokio::test]
async fn stale_requests_are_answered_and_others_still_served() {
    let provider = stub(StubProvider::new("store"));
    let recorder = Recorder::new();
    let engine = Engine::builder(
        config(&[&provider], &recorder)
            .skip_stale_requests(true)
            .build()
            .unwrap(),
    )
    .start();
    ready(&engine).await;
    let mut dropped = engine.bus().subscribe::<RequestDroppedEvent>();

    let screen = TestSurface::new();
    let mine = Recorder::new();
    let stale = engine.attach(Some(&screen.context())).unwrap();
    stale.add_listener(mine.listener());
    screen.destroy();
    let id = stale.purchase("gone").unwrap();

    let event = tokio::time::timeout(WAIT, dropped.recv()).await.unwrap().unwrap();
    assert_eq!(event.request, id);
    assert_eq!(event.client, stale.id());
    assert_eq!(
        mine.wait_for_responses(1, WAIT).await.unwrap()[0].status,
        Status::UnknownError
    );

    let fresh = engine.attach(None).unwrap();
    fresh.purchase("here").unwrap();
    assert_eq!(
        recorder
            .wait_for_responses(2, WAIT)
            .await
            .unwrap()
            .iter()
            .map(|r| r.status)
            .collect::<Vec<_>>(),
        vec![Status::UnknownError, Status::Success]
    );
    assert_eq!(provider.handled(), 1);
    assert_eq!(mine.responses().len(), 1);
}

#[tokio::test]
async fn request_that_goes_stale_while_queued_is_answered_at_replay() {
    let provider = stub(StubProvider::new("store").with_delay(Duration::from_millis(100)));
    let recorder = Recorder::new();
    let engine = Engine::builder(
        config(&[&provider], &recorder)
            .skip_stale_requests(true)
            .build()
            .unwrap(),
    )
    .start();
    ready(&engine).await;
    let mut dropped = engine.bus().subscribe::<RequestDroppedEvent>();

    let first = engine.attach(None).unwrap();
    first.purchase("a").unwrap();
    assert!(eventually(WAIT, || engine.state() == EngineState::Busy).await);

    let screen = TestSurface::new();
    let mine = Recorder::new();
    let waiting = engine.attach(Some(&screen.context())).unwrap();
    waiting.add_listener(mine.listener());
    let id = waiting.purchase("b").unwrap();
    screen.send_to_background();

    let event = tokio::time::timeout(WAIT, dropped.recv()).await.unwrap().unwrap();
    assert_eq!(event.request, id);
    assert_eq!(mine.wait_for_responses(1, WAIT).await.unwrap()[0].status, Status::UnknownError);
    assert_eq!(
        recorder.wait_for_responses(2, WAIT).await.unwrap()[0].status,
        Status::Success
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mine.responses().len(), 1);
    assert_eq!(provider.handled(), 1);
}

#[tokio::test]
async fn rejections_beyond_bus_capacity_all_reach_the_caller() {
    let provider = stub(StubProvider::new("store").with_delay(Duration::from_millis(300)));
    let recorder = Recorder::new();
    let engine = Engine::builder(config(&[&provider], &recorder).build().unwrap())
        .with_settings(EngineSettings {
            bus_capacity: 4,
            ..EngineSettings::default()
        })
        .start();
    ready(&engine).await;
    let mut observed = engine.bus().subscribe::<EngineAnswerEvent>();

    let first = engine.attach(None).unwrap();
    first.purchase("slow").unwrap();
    assert!(eventually(WAIT, || engine.state() == EngineState::Busy).await);

    let mine = Recorder::new();
    let eager = engine.attach(None).unwrap().queue_when_busy(false);
    eager.add_listener(mine.listener());
    for n in 0..10 {
        eager.purchase(format!("sku-{n}")).unwrap();
    }

    let responses = mine.wait_for_responses(10, WAIT).await.unwrap();
    assert!(responses.iter().all(|r| r.status == Status::Busy));
    let all = recorder.wait_for_responses(11, WAIT).await.unwrap();
    assert_eq!(all.iter().filter(|r| r.status == Status::Success).count(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mine.responses().len(), 10);
    // observers get a copy of each made-up answer
    let copy = tokio::time::timeout(WAIT, observed.recv()).await.unwrap().unwrap();
    assert_eq!(copy.0.response.status, Status::Busy);
}

#[tokio::test]
async fn equal_requests_from_two_clients_each_get_one_answer() {
    let provider = stub(StubProvider::new("store").with_delay(Duration::from_millis(100)));
    let recorder = Recorder::new();
    let engine = Engine::builder(config(&[&provider], &recorder).build().unwrap()).start();
    ready(&engine).await;

    let first = engine.attach(None).unwrap();
    first.purchase("first").unwrap();
    assert!(eventually(WAIT, || engine.state() == EngineState::Busy).await);

    let (rec_b, rec_c) = (Recorder::new(), Recorder::new());
    let b = engine.attach(None).unwrap();
    let c = engine.attach(None).unwrap();
    b.add_listener(rec_b.listener());
    c.add_listener(rec_c.listener());
    b.purchase("gem").unwrap();
    c.purchase("gem").unwrap();

    assert_eq!(rec_b.wait_for_responses(1, WAIT).await.unwrap()[0].status, Status::Success);
    assert_eq!(rec_c.wait_for_responses(1, WAIT).await.unwrap()[0].status, Status::Busy);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rec_b.responses().len(), 1);
    assert_eq!(rec_c.responses().len(), 1);
    assert_eq!(provider.handled(), 2);
}

#[tokio::test]
async fn reconfiguration_answers_queued_requests() {
    let old = stub(StubProvider::new("old").with_delay(Duration::from_millis(150)));
    let recorder = Recorder::new();
    let engine = Engine::builder(config(&[&old], &recorder).build().unwrap()).start();
    ready(&engine).await;

    let (rec_a, rec_b) = (Recorder::new(), Recorder::new());
    let a = engine.attach(None).unwrap();
    let b = engine.attach(None).unwrap();
    a.add_listener(rec_a.listener());
    b.add_listener(rec_b.listener());
    a.purchase("in-flight").unwrap();
    assert!(eventually(WAIT, || engine.state() == EngineState::Busy).await);
    b.purchase("queued").unwrap();

    let new = stub(StubProvider::new("new"));
    let replacement = Recorder::new();
    engine
        .set_configuration(config(&[&new], &replacement).build().unwrap())
        .unwrap();

    assert_eq!(
        rec_b.wait_for_responses(1, WAIT).await.unwrap()[0].status,
        Status::NoBillingProvider
    );
    // the request already handed to the old provider still completes
    assert_eq!(rec_a.wait_for_responses(1, WAIT).await.unwrap()[0].status, Status::Success);

    ready(&engine).await;
    a.inventory(true).unwrap();
    let responses = rec_a.wait_for_responses(2, WAIT).await.unwrap();
    assert_eq!(responses[1].provider.as_deref(), Some("new"));
    assert_eq!(replacement.setups(), vec![(SetupStatus::ProviderChanged, Some("new".to_string()))]);
    assert!(eventually(WAIT, || !old.is_registered()).await);
}

#[tokio::test]
async fn dropping_a_client_discards_its_queue() {
    let provider = stub(StubProvider::new("store").with_delay(Duration::from_millis(100)));
    let recorder = Recorder::new();
    let engine = Engine::builder(config(&[&provider], &recorder).build().unwrap()).start();
    ready(&engine).await;

    let keeper = engine.attach(None).unwrap();
    keeper.purchase("kept").unwrap();
    assert!(eventually(WAIT, || engine.state() == EngineState::Busy).await);

    let leaver = engine.attach(None).unwrap();
    leaver.purchase("abandoned").unwrap();
    drop(leaver);

    recorder.wait_for_responses(1, WAIT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(provider.handled(), 1);
    assert_eq!(recorder.responses().len(), 1);
}

#[tokio::test]
async fn removed_listener_stops_receiving() {
    let provider = stub(StubProvider::new("store"));
    let recorder = Recorder::new();
    let engine = Engine::builder(config(&[&provider], &recorder).build().unwrap()).start();
    ready(&engine).await;

    let (kept, removed) = (Recorder::new(), Recorder::new());
    let client = engine.attach(None).unwrap();
    client.add_listener(kept.listener());
    let id = client.add_listener(removed.listener());
    assert!(client.remove_listener(id));
    assert!(!client.remove_listener(id));

    client.sku_details(["gem", "coin"]).unwrap();
    kept.wait_for_responses(1, WAIT).await.unwrap();
    assert!(removed.responses().is_empty());
    assert_eq!(recorder.responses().len(), 1);
}

struct ReceiptCheck;

impl PurchaseVerifier for ReceiptCheck {
    fn verify(&self, _provider: &str, purchase: &Purchase) -> Verification {
        if purchase.receipt.as_deref() == Some("signed") {
            Verification::Verified
        } else {
            Verification::Failed
        }
    }
}

#[tokio::test]
async fn inventory_is_verified() {
    let owned = vec![
        Purchase::new("gem", "o1", "t1").with_receipt("signed"),
        Purchase::new("coin", "o2", "t2").with_receipt("signed"),
    ];
    let provider = stub(StubProvider::new("store").owning(owned));
    let recorder = Recorder::new();
    let engine = Engine::builder(
        config(&[&provider], &recorder)
            .verifier(Arc::new(ReceiptCheck))
            .build()
            .unwrap(),
    )
    .start();
    ready(&engine).await;

    let client = engine.attach(None).unwrap();
    client.inventory(true).unwrap();
    let responses = recorder.wait_for_responses(1, WAIT).await.unwrap();
    assert_eq!(responses[0].verification(), Some(Verification::Verified));
}

#[tokio::test]
async fn global_listener_sees_requests_and_setup() {
    let provider = stub(StubProvider::new("store"));
    let recorder = Recorder::new();
    let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let engine = Engine::builder(config(&[&provider], &recorder).build().unwrap()).start();
    ready(&engine).await;

    let client = engine.attach(None).unwrap();
    client.add_listener(Listener::new().on_response(move |_| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }));
    client.consume(Purchase::new("gem", "o1", "t1")).unwrap();

    recorder.wait_for_responses(1, WAIT).await.unwrap();
    assert!(recorder
        .events()
        .contains(&tollgate_testing::Recorded::Request { kind: "consume" }));
    assert!(eventually(WAIT, || seen.load(std::sync::atomic::Ordering::SeqCst) == 1).await);
}

#[tokio::test]
async fn shutdown_unbinds_and_refuses_further_work() {
    let provider = stub(StubProvider::new("store"));
    let recorder = Recorder::new();
    let engine = Engine::builder(config(&[&provider], &recorder).build().unwrap()).start();
    ready(&engine).await;
    let client = engine.attach(None).unwrap();

    engine.shutdown().await.unwrap();

    assert!(!engine.is_running());
    assert!(!provider.is_registered());
    assert!(matches!(client.purchase("late"), Err(TollgateError::EngineStopped)));
    assert!(matches!(engine.setup(), Err(TollgateError::EngineStopped)));
}
