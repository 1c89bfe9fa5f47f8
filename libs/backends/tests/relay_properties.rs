//! Relay Loop Properties
//!
//! Exercises the delivery bridge the way broker callbacks drive it:
//! - many producers delivering at once
//! - single-shot completion under contention
//! - payload bytes surviving normalization untouched

use proptest::prelude::*;
use relay_backends::test_utils::TestEnvelope;
use relay_backends::{BackendError, Delivery, Relay, SerializeFailure};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const PRODUCERS: usize = 8;
const PER_PRODUCER: usize = 50;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deliveries_are_numbered_in_channel_order() {
    let total = PRODUCERS * PER_PRODUCER;
    // small buffer so producers block on backpressure while holding the sequence
    let (results_tx, mut results) = mpsc::channel(4);
    let (errors_tx, _errors) = mpsc::channel(4);
    let relay = Relay::new("test", true, SerializeFailure::Continue, results_tx, errors_tx);

    let mut producers = Vec::new();
    for producer in 0..PRODUCERS {
        let relay = relay.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..PER_PRODUCER {
                let payload = format!("{producer}-{i}");
                let delivery = relay.deliver(&TestEnvelope::new("load", payload.as_bytes())).await;
                assert!(matches!(delivery, Delivery::Emitted(_)));
            }
        }));
    }

    let mut nums = Vec::with_capacity(total);
    let mut payloads = HashSet::new();
    while nums.len() < total {
        let record = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .expect("relay stalled")
            .expect("results channel closed");
        nums.push(record.num);
        payloads.insert(record.payload);
    }

    for producer in producers {
        producer.await.unwrap();
    }

    let expected: Vec<i64> = (1..=total as i64).collect();
    assert_eq!(nums, expected);
    assert_eq!(payloads.len(), total);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_shot_under_contention_emits_one_record() {
    let (results_tx, mut results) = mpsc::channel(64);
    let (errors_tx, _errors) = mpsc::channel(64);
    let relay = Relay::new("test", false, SerializeFailure::Continue, results_tx, errors_tx);
    let ctx = CancellationToken::new();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let relay = relay.clone();
            tokio::spawn(async move {
                let mut emitted = 0;
                for i in 0..PER_PRODUCER {
                    let payload = [producer as u8, i as u8];
                    if let Delivery::Emitted(_) = relay.deliver(&TestEnvelope::new("burst", &payload)).await {
                        emitted += 1;
                    }
                }
                emitted
            })
        })
        .collect();

    let outcome = relay
        .run(&ctx, std::future::pending::<Result<(), BackendError>>())
        .await;
    assert!(outcome.is_ok());

    let mut emitted = 0;
    for producer in producers {
        emitted += producer.await.unwrap();
    }
    assert_eq!(emitted, 1);

    let record = results.recv().await.unwrap();
    assert_eq!(record.num, 1);
    assert!(results.try_recv().is_err());
}

#[tokio::test]
async fn test_message_ids_are_unique() {
    let (results_tx, mut results) = mpsc::channel(16);
    let (errors_tx, _errors) = mpsc::channel(16);
    let relay = Relay::new("test", true, SerializeFailure::Continue, results_tx, errors_tx);

    for i in 0..10u8 {
        relay.deliver(&TestEnvelope::new("ids", &[i])).await;
    }

    let mut ids = HashSet::new();
    for _ in 0..10 {
        ids.insert(results.recv().await.unwrap().message_id);
    }
    assert_eq!(ids.len(), 10);
}

proptest! {
    #[test]
    fn prop_payload_bytes_are_preserved(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let record = runtime.block_on(async {
            let (results_tx, mut results) = mpsc::channel(1);
            let (errors_tx, _errors) = mpsc::channel(1);
            let relay = Relay::new("test", false, SerializeFailure::Continue, results_tx, errors_tx);
            relay.deliver(&TestEnvelope::new("bytes", &payload)).await;
            results.recv().await.unwrap()
        });

        prop_assert_eq!(&record.payload, &payload);
        prop_assert!(record.raw.is_some());
    }
}
