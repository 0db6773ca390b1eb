//! Integration tests for `NatsStreamBroker`.
//!
//! Require a NATS server with JetStream enabled. Run with:
//! ```bash
//! RUNLOOP_TEST_NATS_URL=nats://127.0.0.1:4222 cargo test -p runloop-infra --test nats_broker
//! ```
//! Every test returns early when the variable is unset.

use std::time::Duration;

use runloop_core::stream::StreamBroker;
use runloop_infra::nats::NatsStreamBroker;
use runloop_types::chunk::Chunk;
use runloop_types::config::BrokerSection;
use runloop_types::conversation::new_id;
use tokio_util::sync::CancellationToken;

async fn broker() -> Option<NatsStreamBroker> {
    let Ok(url) = std::env::var("RUNLOOP_TEST_NATS_URL") else {
        eprintln!("skipping nats broker test: RUNLOOP_TEST_NATS_URL not set");
        return None;
    };
    let section = BrokerSection {
        nats_url: url,
        ..Default::default()
    };
    Some(NatsStreamBroker::connect(&section).await.unwrap())
}

fn created(response_id: &str) -> Chunk {
    Chunk::ResponseCreated {
        response_id: response_id.to_string(),
    }
}

#[tokio::test]
async fn test_fan_out_to_all_subscribers() {
    let Some(broker) = broker().await else {
        return;
    };
    let key = new_id("msg");
    let mut a = broker.subscribe(&key, CancellationToken::new()).await.unwrap();
    let mut b = broker.subscribe(&key, CancellationToken::new()).await.unwrap();

    broker.publish(&key, &created("r1")).await.unwrap();
    broker.close(&key).await.unwrap();

    for sub in [&mut a, &mut b] {
        let chunk = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap();
        assert_eq!(chunk, Some(created("r1")));
        let end = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap();
        assert!(end.is_none());
    }
}

#[tokio::test]
async fn test_late_subscribe_after_close_is_finished() {
    let Some(broker) = broker().await else {
        return;
    };
    let key = new_id("msg");
    broker.close(&key).await.unwrap();

    let mut late = broker.subscribe(&key, CancellationToken::new()).await.unwrap();
    let next = tokio::time::timeout(Duration::from_secs(1), late.recv())
        .await
        .unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_cancel_ends_subscription() {
    let Some(broker) = broker().await else {
        return;
    };
    let key = new_id("msg");
    let cancel = CancellationToken::new();
    let mut sub = broker.subscribe(&key, cancel.clone()).await.unwrap();
    cancel.cancel();

    let next = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .unwrap();
    assert!(next.is_none());
}
