use std::sync::Arc;
use std::time::Duration;

use tollgate::{
    ActivityResult, BillingProvider, Configuration, Engine, EngineHandle, EngineSettings, EngineState, Status,
    UiHost, RESULT_CANCELED, RESULT_OK,
};
use tollgate_testing::{eventually, FlowOutcome, Recorder, StubProvider, TestSurface, ThreadUiHost, UI_THREAD_NAME};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    engine: EngineHandle,
    host: Arc<ThreadUiHost>,
    provider: Arc<StubProvider>,
    recorder: Recorder,
}

async fn harness(provider: StubProvider, settings: EngineSettings) -> Harness {
    let provider = Arc::new(provider);
    let recorder = Recorder::new();
    let host = ThreadUiHost::new();
    let engine = Engine::builder(
        Configuration::builder()
            .provider(Arc::clone(&provider) as Arc<dyn BillingProvider>)
            .listener(recorder.listener())
            .build()
            .unwrap(),
    )
    .with_ui_host(Arc::clone(&host) as Arc<dyn UiHost>)
    .with_settings(settings)
    .start();

    engine.setup().unwrap();
    assert!(eventually(WAIT, || engine.state() == EngineState::Ready).await);
    Harness {
        engine,
        host,
        provider,
        recorder,
    }
}

impl Harness {
    /// Waits for the provider's flow to be launched and returns its request code.
    async fn launched(&self) -> i32 {
        assert!(
            eventually(WAIT, || !self.provider.launches().is_empty()).await,
            "flow was never launched"
        );
        self.provider.launches()[0].0
    }

    fn answer(&self, request_code: i32, result_code: i32) {
        self.engine.bus().publish(ActivityResult {
            request_code,
            result_code,
            data: None,
        });
    }

    async fn status(&self) -> Status {
        self.recorder.wait_for_responses(1, WAIT).await.unwrap()[0].status
    }
}

fn flow(deadline: Duration) -> StubProvider {
    StubProvider::new("store").with_foreground_flow(Some(deadline))
}

#[tokio::test]
async fn result_completes_the_purchase() {
    let h = harness(flow(WAIT), EngineSettings::default()).await;
    let client = h.engine.attach(None).unwrap();
    client.purchase("gem").unwrap();

    let code = h.launched().await;
    assert_eq!(h.provider.launches()[0].1.as_deref(), Some(UI_THREAD_NAME));
    h.answer(code, RESULT_OK);

    assert_eq!(h.status().await, Status::Success);
    assert_eq!(h.provider.flows(), vec![FlowOutcome::Completed]);
    assert_eq!(h.host.surfaces().len(), 1);
    assert!(eventually(WAIT, || h.host.surfaces()[0].is_finished()).await);
    assert!(!h.engine.activity_monitor().is_pending(code));
}

#[tokio::test]
async fn canceled_result_is_user_canceled() {
    let h = harness(flow(WAIT), EngineSettings::default()).await;
    let client = h.engine.attach(None).unwrap();
    client.purchase("gem").unwrap();

    let code = h.launched().await;
    h.answer(code, RESULT_CANCELED);

    assert_eq!(h.status().await, Status::UserCanceled);
    assert_eq!(h.provider.flows(), vec![FlowOutcome::Canceled]);
}

#[tokio::test]
async fn result_for_another_code_is_ignored() {
    let h = harness(flow(Duration::from_millis(200)), EngineSettings::default()).await;
    let client = h.engine.attach(None).unwrap();
    client.purchase("gem").unwrap();

    let code = h.launched().await;
    h.answer(code.wrapping_add(100), RESULT_OK);

    assert_eq!(h.status().await, Status::UnknownError);
    assert_eq!(h.provider.flows(), vec![FlowOutcome::Absent]);
}

#[tokio::test]
async fn missing_result_times_out() {
    let h = harness(flow(Duration::from_millis(100)), EngineSettings::default()).await;
    let client = h.engine.attach(None).unwrap();
    client.purchase("gem").unwrap();

    h.launched().await;
    assert_eq!(h.status().await, Status::UnknownError);
    assert_eq!(h.provider.flows(), vec![FlowOutcome::Absent]);
    assert_eq!(h.engine.state(), EngineState::Ready);
}

#[tokio::test]
async fn surface_that_never_appears_ends_the_flow() {
    let settings = EngineSettings {
        surface_ready_timeout: Duration::from_millis(100),
        ..EngineSettings::default()
    };
    let h = harness(flow(WAIT), settings).await;
    h.host.provide_surfaces(false);

    let client = h.engine.attach(None).unwrap();
    client.purchase("gem").unwrap();

    assert_eq!(h.status().await, Status::UnknownError);
    assert!(h.provider.launches().is_empty());
    assert!(h.host.surfaces().is_empty());
}

#[tokio::test]
async fn failing_launch_ends_the_flow() {
    let h = harness(flow(WAIT).with_failing_launch(), EngineSettings::default()).await;
    let client = h.engine.attach(None).unwrap();
    client.purchase("gem").unwrap();

    assert_eq!(h.status().await, Status::UnknownError);
    assert!(eventually(WAIT, || h.host.surfaces().iter().all(|s| s.is_finished())).await);
}

#[tokio::test]
async fn self_delivering_origin_skips_the_transient_surface() {
    let h = harness(flow(WAIT), EngineSettings::default()).await;
    let screen = TestSurface::new();
    let client = h.engine.attach(Some(&screen.context())).unwrap().self_delivers(true);
    client.purchase("gem").unwrap();

    let code = h.launched().await;
    h.answer(code, RESULT_OK);

    assert_eq!(h.status().await, Status::Success);
    assert!(h.host.surfaces().is_empty());
    assert!(!screen.is_finished());
}

#[tokio::test]
async fn origin_that_does_not_deliver_still_gets_a_transient_surface() {
    let h = harness(flow(WAIT), EngineSettings::default()).await;
    let screen = TestSurface::new();
    let client = h.engine.attach(Some(&screen.context())).unwrap();
    client.purchase("gem").unwrap();

    let code = h.launched().await;
    h.answer(code, RESULT_OK);

    assert_eq!(h.status().await, Status::Success);
    assert_eq!(h.host.surfaces().len(), 1);
}

#[tokio::test]
async fn resumed_surface_without_result_finishes_itself() {
    let settings = EngineSettings {
        surface_finish_delay: Duration::from_millis(50),
        ..EngineSettings::default()
    };
    let h = harness(flow(WAIT), settings).await;
    let client = h.engine.attach(None).unwrap();
    client.purchase("gem").unwrap();

    h.launched().await;
    assert!(
        eventually(WAIT, || h.engine.activity_monitor().transient_state()
            == Some(tollgate::SurfaceState::Relayed))
        .await
    );
    h.host.resume_transient_surface();

    assert_eq!(h.status().await, Status::UnknownError);
    assert_eq!(h.provider.flows(), vec![FlowOutcome::Absent]);
    assert!(eventually(WAIT, || h.host.surfaces()[0].is_finished()).await);
}

#[tokio::test]
async fn flows_run_one_after_another() {
    let h = harness(flow(WAIT), EngineSettings::default()).await;
    let client = h.engine.attach(None).unwrap();
    client.purchase("first").unwrap();
    client.purchase("second").unwrap();

    let first = h.launched().await;
    h.answer(first, RESULT_OK);
    assert!(eventually(WAIT, || h.provider.launches().len() == 2).await);
    let second = h.provider.launches()[1].0;
    assert_ne!(first, second);
    h.answer(second, RESULT_OK);

    let statuses: Vec<Status> = h
        .recorder
        .wait_for_responses(2, WAIT)
        .await
        .unwrap()
        .iter()
        .map(|r| r.status)
        .collect();
    assert_eq!(statuses, vec![Status::Success, Status::Success]);
    assert_eq!(h.host.surfaces().len(), 2);
}
