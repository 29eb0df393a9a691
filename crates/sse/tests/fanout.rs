//! End-to-end fan-out: a value published through one connection manager
//! crosses the stream and reaches subscribers hanging off a broadcast
//! consumer, the way two service instances share bid events.

use std::time::Duration;

use gavel_bootable::Bootable;
use gavel_sse::{ConnectionManager, ConnectionManagerOptions, Envelope};
use gavel_store_memory::MemoryStore;
use gavel_streams::{BroadcastConsumer, Producer};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct BidEvent {
    bidder: String,
    amount: u64,
}

#[tokio::test]
async fn test_publish_crosses_the_stream_to_subscribers() {
    let store = MemoryStore::new();

    let consumer =
        BroadcastConsumer::<Envelope<BidEvent>, _>::new(store.clone(), "sse-events").unwrap();
    let producer = Producer::<Envelope<BidEvent>, _>::new(store, "sse-events").unwrap();
    producer.start().await.unwrap();

    let manager = ConnectionManager::with_options(
        &consumer,
        ConnectionManagerOptions {
            buffer: 4,
            publisher: Some(producer),
        },
    )
    .unwrap();

    consumer.start().await.unwrap();
    manager.start().await.unwrap();
    // Let the tail consumer reach its new-only cursor before publishing.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut watcher = manager.subscribe("item-42").await.unwrap();
    let mut bystander = manager.subscribe("item-7").await.unwrap();

    manager
        .publish(
            "item-42",
            BidEvent {
                bidder: "mallory".to_string(),
                amount: 300,
            },
        )
        .unwrap();

    let got = timeout(Duration::from_secs(2), watcher.recv())
        .await
        .expect("event should arrive through the stream")
        .expect("channel open");
    assert_eq!(got.amount, 300);
    assert_eq!(got.bidder, "mallory");

    assert!(
        timeout(Duration::from_millis(100), bystander.recv())
            .await
            .is_err(),
        "other topics see nothing"
    );

    manager.shutdown().await.unwrap();
    consumer.shutdown().await.unwrap();
}
