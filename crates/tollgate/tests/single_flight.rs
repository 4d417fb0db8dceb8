use std::sync::Arc;
use std::time::Duration;

use tollgate::{BillingProvider, Configuration, Engine, EngineState, ResponsePayload, Status};
use tollgate_testing::{eventually, Recorder, StubProvider};

const CLIENTS: usize = 4;
const PER_CLIENT: usize = 10;

fn sku_of(payload: &ResponsePayload) -> Option<&str> {
    match payload {
        ResponsePayload::Purchase { sku, .. } => Some(sku),
        _ => None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_are_served_one_at_a_time_in_order() {
    let provider = Arc::new(
        StubProvider::new("store")
            .with_delay(Duration::from_millis(1))
            .with_jitter(Duration::from_millis(3)),
    );
    let engine = Engine::builder(
        Configuration::builder()
            .provider(Arc::clone(&provider) as Arc<dyn BillingProvider>)
            .build()
            .unwrap(),
    )
    .start();
    engine.setup().unwrap();
    assert!(eventually(Duration::from_secs(5), || engine.state() == EngineState::Ready).await);

    let mut posting = Vec::new();
    let mut recorders = Vec::new();
    for c in 0..CLIENTS {
        let recorder = Recorder::new();
        let client = engine.attach(None).unwrap();
        client.add_listener(recorder.listener());
        recorders.push(recorder);

        posting.push(tokio::spawn(async move {
            for n in 0..PER_CLIENT {
                client.purchase(format!("c{c}-sku{n}")).unwrap();
                if fastrand::bool() {
                    tokio::task::yield_now().await;
                }
            }
            // keep the client attached until its answers are in
            client
        }));
    }
    let mut clients = Vec::new();
    for task in posting {
        clients.push(task.await.unwrap());
    }

    for (c, recorder) in recorders.iter().enumerate() {
        let responses = recorder
            .wait_for_responses(PER_CLIENT, Duration::from_secs(20))
            .await
            .unwrap();
        assert!(responses.iter().all(|r| r.status == Status::Success));

        let skus: Vec<String> = responses
            .iter()
            .filter_map(|r| sku_of(&r.payload).map(str::to_string))
            .collect();
        let expected: Vec<String> = (0..PER_CLIENT).map(|n| format!("c{c}-sku{n}")).collect();
        assert_eq!(skus, expected, "client {c} saw its answers out of order");
    }

    assert_eq!(provider.max_concurrent(), 1);
    assert_eq!(provider.handled(), CLIENTS * PER_CLIENT);
    assert!(eventually(Duration::from_secs(5), || engine.state() == EngineState::Ready).await);
    drop(clients);
    engine.shutdown().await.unwrap();
}
