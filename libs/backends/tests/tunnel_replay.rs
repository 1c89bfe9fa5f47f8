//! Tunnel and Write Behaviour
//!
//! Drives the replay and batch-publish loops through their public API with
//! an in-process tunnel and a publisher that fails on demand.

use relay_backends::test_utils::{FailingTunnel, FlakyPublisher};
use relay_backends::{publish, tunnel, BackendError, ChannelTunnel};
use relay_types::{TunnelOutboundRecord, WriteRecord};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_tunnel_keeps_replaying_after_failures() {
    let (mut service, outbound) = ChannelTunnel::new(16);
    let (errors_tx, mut errors) = mpsc::channel(16);
    let ctx = CancellationToken::new();

    let loop_ctx = ctx.clone();
    let replay = tokio::spawn(async move {
        let mut publisher = FlakyPublisher::failing_at([1, 3]);
        let result = tunnel::run(
            &loop_ctx,
            "test",
            "replay.orders",
            &mut publisher,
            &mut service,
            errors_tx,
        )
        .await;
        (result, publisher)
    });

    for i in 0..5u8 {
        outbound
            .send(TunnelOutboundRecord::new(vec![i], format!("replay-{i}")))
            .await
            .unwrap();
    }

    let first = errors.recv().await.unwrap();
    let second = errors.recv().await.unwrap();
    assert_eq!(first.metadata.get("replay_id").map(String::as_str), Some("replay-1"));
    assert_eq!(second.metadata.get("replay_id").map(String::as_str), Some("replay-3"));

    // give the loop time to publish the last record before cancelling
    tokio::time::sleep(Duration::from_millis(20)).await;
    ctx.cancel();

    let (result, publisher) = replay.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(publisher.calls(), 5);
    assert_eq!(publisher.published_payloads(), vec![vec![0], vec![2], vec![4]]);
    assert!(publisher
        .published()
        .iter()
        .all(|p| p.destination == "replay.orders"));
}

#[tokio::test]
async fn test_tunnel_start_failure() {
    let mut service = FailingTunnel::new("no replay configured");
    let mut publisher = FlakyPublisher::new();
    let (errors_tx, _errors) = mpsc::channel(1);

    let err = tunnel::run(
        &CancellationToken::new(),
        "test",
        "replay.orders",
        &mut publisher,
        &mut service,
        errors_tx,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, BackendError::Tunnel(_)));
    assert_eq!(publisher.calls(), 0);
}

#[tokio::test]
async fn test_write_reports_each_failed_record() {
    let mut publisher = FlakyPublisher::failing_at([0, 2]);
    let (errors_tx, mut errors) = mpsc::channel(8);
    let records = (0..4u8).map(|i| WriteRecord::new(vec![i])).collect();

    publish::write_all(
        &CancellationToken::new(),
        "test",
        "orders",
        &mut publisher,
        records,
        &errors_tx,
    )
    .await
    .unwrap();
    drop(errors_tx);

    let mut failed = Vec::new();
    while let Some(error) = errors.recv().await {
        failed.push(error.metadata["index"].clone());
    }
    assert_eq!(failed, vec!["0", "2"]);
    assert_eq!(publisher.published_payloads(), vec![vec![1], vec![3]]);
}
