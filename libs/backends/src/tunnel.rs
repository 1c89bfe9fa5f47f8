//! Replay of records supplied by an external tunnel service

use crate::publish::Publisher;
use crate::relay::report;
use crate::BackendError;
use async_trait::async_trait;
use relay_types::{ErrorRecord, TunnelOutboundRecord};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Source of records to replay into a broker
#[async_trait]
pub trait TunnelService: Send {
    /// Begin producing records; `backend_label` identifies the destination broker
    async fn start(
        &mut self,
        ctx: &CancellationToken,
        backend_label: &str,
        errors: mpsc::Sender<ErrorRecord>,
    ) -> Result<(), BackendError>;

    /// Hand over the outbound stream; `None` once it has been taken
    fn read(&mut self) -> Option<mpsc::Receiver<TunnelOutboundRecord>>;
}

/// In-process tunnel fed through an [`mpsc::Sender`]
#[derive(Debug)]
pub struct ChannelTunnel {
    outbound: Option<mpsc::Receiver<TunnelOutboundRecord>>,
}

impl ChannelTunnel {
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<TunnelOutboundRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { outbound: Some(rx) }, tx)
    }
}

#[async_trait]
impl TunnelService for ChannelTunnel {
    async fn start(
        &mut self,
        _ctx: &CancellationToken,
        backend_label: &str,
        _errors: mpsc::Sender<ErrorRecord>,
    ) -> Result<(), BackendError> {
        if self.outbound.is_none() {
            return Err(BackendError::Tunnel("channel tunnel already consumed".to_string()));
        }
        debug!(backend = backend_label, "Channel tunnel started");
        Ok(())
    }

    fn read(&mut self) -> Option<mpsc::Receiver<TunnelOutboundRecord>> {
        self.outbound.take()
    }
}

/// Publish every record from `service` to `destination` until `ctx` is cancelled
///
/// Publish failures are logged and reported, then the loop moves on. A closed
/// outbound stream leaves the loop idle until cancellation.
pub async fn run<P: Publisher + ?Sized>(
    ctx: &CancellationToken,
    backend: &'static str,
    destination: &str,
    publisher: &mut P,
    service: &mut dyn TunnelService,
    errors: mpsc::Sender<ErrorRecord>,
) -> Result<(), BackendError> {
    service
        .start(ctx, backend, errors.clone())
        .await
        .map_err(|e| match e {
            BackendError::Tunnel(_) => e,
            other => BackendError::Tunnel(other.to_string()),
        })?;

    let mut outbound = service
        .read()
        .ok_or_else(|| BackendError::Tunnel("tunnel service has no outbound stream".to_string()))?;

    info!(backend, destination, "Tunnel started, waiting for replay records");
    let no_headers = BTreeMap::new();

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                info!(backend, "Tunnel cancelled");
                return Ok(());
            }
            next = outbound.recv() => {
                let Some(record) = next else {
                    warn!(backend, "Tunnel outbound stream closed, waiting for cancellation");
                    ctx.cancelled().await;
                    return Ok(());
                };

                match publisher.publish(destination, &record.blob, &no_headers).await {
                    Ok(()) => debug!(backend, destination, replay_id = %record.replay_id, "Replayed message"),
                    Err(e) => {
                        error!(
                            backend,
                            destination,
                            replay_id = %record.replay_id,
                            error = %e,
                            "Unable to replay message"
                        );
                        report(
                            backend,
                            &errors,
                            ErrorRecord::new(format!("unable to replay message: {e}"))
                                .with_metadata("replay_id", record.replay_id.clone())
                                .with_metadata("destination", destination),
                        )
                        .await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FailingTunnel, FlakyPublisher};
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_failure_is_not_fatal() {
        let (mut service, outbound) = ChannelTunnel::new(8);
        let (errors_tx, mut errors) = mpsc::channel(8);
        let ctx = CancellationToken::new();

        outbound.send(TunnelOutboundRecord::new("first", "r-1")).await.unwrap();
        outbound.send(TunnelOutboundRecord::new("second", "r-2")).await.unwrap();
        drop(outbound);

        let loop_ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            let mut publisher = FlakyPublisher::failing_at([0]);
            let result = run(&loop_ctx, "test", "replays", &mut publisher, &mut service, errors_tx).await;
            (result, publisher)
        });

        let error = errors.recv().await.unwrap();
        assert_eq!(error.metadata.get("replay_id").map(String::as_str), Some("r-1"));

        // stream closed, the loop idles until cancelled
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        ctx.cancel();

        let (result, publisher) = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(publisher.published_payloads(), vec![b"second".to_vec()]);
    }

    #[tokio::test]
    async fn test_start_failure_is_tunnel_error() {
        let mut service = FailingTunnel::new("replay service unavailable");
        let mut publisher = FlakyPublisher::new();
        let (errors_tx, _errors) = mpsc::channel(1);
        let ctx = CancellationToken::new();

        let err = run(&ctx, "test", "replays", &mut publisher, &mut service, errors_tx)
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::Tunnel(_)));
        assert!(err.to_string().contains("replay service unavailable"));
    }

    #[tokio::test]
    async fn test_cancel_returns_ok() {
        let (mut service, _outbound) = ChannelTunnel::new(1);
        let mut publisher = FlakyPublisher::new();
        let (errors_tx, _errors) = mpsc::channel(1);
        let ctx = CancellationToken::new();
        ctx.cancel();

        let result = run(&ctx, "test", "replays", &mut publisher, &mut service, errors_tx).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_channel_tunnel_is_single_use() {
        let (mut service, _outbound) = ChannelTunnel::new(1);
        let (errors_tx, _errors) = mpsc::channel(1);
        let ctx = CancellationToken::new();

        service.start(&ctx, "test", errors_tx.clone()).await.unwrap();
        assert!(service.read().is_some());
        assert!(service.read().is_none());
        assert!(service.start(&ctx, "test", errors_tx).await.is_err());
    }
}
