//! NATS JetStream: acknowledged publishes and pull-consumer reads

use super::nats_conn::{self, ConnectionHandle};
use crate::error::{BackendError, Operation};
use crate::lifecycle::HandleStack;
use crate::publish::{self, Publisher};
use crate::relay::{Delivery, Envelope, Relay, SerializeFailure};
use crate::tunnel::{self, TunnelService};
use crate::{validate, Backend};
use async_nats::jetstream::{self, consumer};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use relay_types::{
    BackendRecord, ConnectionOptions, ErrorRecord, NatsJetstreamConn, NatsJetstreamReadArgs,
    NatsJetstreamRecord, NatsJetstreamTunnelArgs, NatsJetstreamWriteArgs, ReadOptions,
    ReadRecord, TunnelOptions, ValidationError, WriteOptions, WriteRecord,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const BACKEND_NAME: &str = "nats-jetstream";

#[derive(Debug)]
pub struct NatsJetstream {
    context: Option<jetstream::Context>,
    handles: HandleStack,
}

impl NatsJetstream {
    pub async fn new(options: &ConnectionOptions) -> Result<Self, BackendError> {
        let args = validate_base_conn_opts(options)
            .map_err(|e| BackendError::validation(Operation::Connect, e))?;

        let client = nats_conn::connect(BACKEND_NAME, &args.nats).await?;
        let mut handles = HandleStack::new(BACKEND_NAME);
        handles.push(ConnectionHandle::new(client.clone()));

        Ok(Self {
            context: Some(jetstream::new(client)),
            handles,
        })
    }

    fn context(&self) -> Result<&jetstream::Context, BackendError> {
        self.context.as_ref().ok_or(BackendError::Closed)
    }
}

fn validate_base_conn_opts(
    options: &ConnectionOptions,
) -> Result<&NatsJetstreamConn, ValidationError> {
    let args = validate::require_conn(options, ConnectionOptions::nats_jetstream)?;
    nats_conn::validate_conn(&args.nats)?;
    Ok(args)
}

fn validate_read_options(options: &ReadOptions) -> Result<&NatsJetstreamReadArgs, ValidationError> {
    let args = validate::require_args(options.nats_jetstream.as_ref())?;
    validate::non_empty(&args.stream, ValidationError::EmptyStream)?;
    if args.start_sequence == Some(0) {
        return Err(ValidationError::InvalidStartSequence);
    }
    Ok(args)
}

fn validate_write_options<'a>(
    options: &'a WriteOptions,
    records: &[WriteRecord],
) -> Result<&'a NatsJetstreamWriteArgs, ValidationError> {
    let args = validate::require_args(options.nats_jetstream.as_ref())?;
    validate::non_empty(&args.subject, ValidationError::MissingSubject)?;
    if records.is_empty() {
        return Err(ValidationError::NoWriteRecords);
    }
    Ok(args)
}

fn validate_tunnel_options(
    options: &TunnelOptions,
) -> Result<&NatsJetstreamTunnelArgs, ValidationError> {
    let args = validate::require_args(options.nats_jetstream.as_ref())?;
    validate::non_empty(&args.subject, ValidationError::MissingSubject)?;
    Ok(args)
}

fn consumer_config(args: &NatsJetstreamReadArgs) -> consumer::pull::Config {
    let deliver_policy = match args.start_sequence {
        Some(start_sequence) => consumer::DeliverPolicy::ByStartSequence { start_sequence },
        None => consumer::DeliverPolicy::All,
    };

    consumer::pull::Config {
        durable_name: args.consumer_name.clone(),
        filter_subject: args.filter_subject.clone().unwrap_or_default(),
        deliver_policy,
        ack_policy: consumer::AckPolicy::Explicit,
        ..Default::default()
    }
}

/// JSON snapshot of a JetStream delivery and its metadata
#[derive(Debug, Serialize)]
struct JetstreamEnvelope {
    stream: String,
    consumer: String,
    subject: String,
    reply: Option<String>,
    headers: BTreeMap<String, String>,
    data: Vec<u8>,
    stream_sequence: u64,
    consumer_sequence: u64,
    delivered: i64,
    pending: u64,
}

impl JetstreamEnvelope {
    fn new(stream: &str, message: &jetstream::Message) -> Self {
        let inner = &message.message;
        let mut envelope = Self {
            stream: stream.to_string(),
            consumer: String::new(),
            subject: inner.subject.to_string(),
            reply: inner.reply.as_ref().map(|r| r.to_string()),
            headers: nats_conn::from_header_map(inner.headers.as_ref()),
            data: inner.payload.to_vec(),
            stream_sequence: 0,
            consumer_sequence: 0,
            delivered: 0,
            pending: 0,
        };

        if let Ok(info) = message.info() {
            envelope.stream = info.stream.to_string();
            envelope.consumer = info.consumer.to_string();
            envelope.stream_sequence = info.stream_sequence;
            envelope.consumer_sequence = info.consumer_sequence;
            envelope.delivered = info.delivered;
            envelope.pending = info.pending;
        }
        envelope
    }
}

impl Envelope for JetstreamEnvelope {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    fn to_record(&self, _received_at: i64) -> BackendRecord {
        BackendRecord::NatsJetstream(NatsJetstreamRecord {
            stream: self.stream.clone(),
            consumer_name: self.consumer.clone(),
            subject: self.subject.clone(),
            value: self.data.clone(),
            stream_sequence: self.stream_sequence,
            consumer_sequence: self.consumer_sequence,
            headers: self.headers.clone(),
        })
    }
}

#[async_trait]
impl Publisher for NatsJetstream {
    async fn publish(
        &mut self,
        destination: &str,
        payload: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        let context = self.context()?;
        let payload = Bytes::copy_from_slice(payload);

        let pending = match nats_conn::to_header_map(headers) {
            Some(headers) => {
                context
                    .publish_with_headers(destination.to_string(), headers, payload)
                    .await
            }
            None => context.publish(destination.to_string(), payload).await,
        }
        .map_err(|e| BackendError::publish(destination, e))?;

        let ack = pending
            .await
            .map_err(|e| BackendError::publish(destination, e))?;
        debug!(
            backend = BACKEND_NAME,
            stream = %ack.stream,
            sequence = ack.sequence,
            "Publish acknowledged"
        );
        Ok(())
    }
}

#[async_trait]
impl Backend for NatsJetstream {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn test(&mut self, _ctx: &CancellationToken) -> Result<(), BackendError> {
        self.context()?
            .query_account()
            .await
            .map_err(|e| BackendError::HealthCheck(e.to_string()))?;
        debug!(backend = BACKEND_NAME, "Account reachable");
        Ok(())
    }

    async fn close(&mut self, _ctx: &CancellationToken) -> Result<(), BackendError> {
        self.context = None;
        self.handles.close_all().await
    }

    async fn read(
        &mut self,
        ctx: &CancellationToken,
        options: &ReadOptions,
        results: mpsc::Sender<ReadRecord>,
        errors: mpsc::Sender<ErrorRecord>,
    ) -> Result<(), BackendError> {
        let args = validate_read_options(options)
            .map_err(|e| BackendError::validation(Operation::Read, e))?;
        let stream_name = args.stream.as_str();

        let stream = self
            .context()?
            .get_stream(stream_name)
            .await
            .map_err(|e| BackendError::subscribe(stream_name, e))?;
        let consumer = stream
            .create_consumer(consumer_config(args))
            .await
            .map_err(|e| BackendError::subscribe(stream_name, e))?;
        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| BackendError::subscribe(stream_name, e))?;

        info!(
            backend = BACKEND_NAME,
            stream = stream_name,
            durable = args.consumer_name.as_deref().unwrap_or("<ephemeral>"),
            "Created pull consumer"
        );

        let relay = Relay::new(
            BACKEND_NAME,
            options.continuous,
            SerializeFailure::Continue,
            results,
            errors,
        );

        let result = relay
            .run(ctx, async {
                while let Some(next) = messages.next().await {
                    let message = match next {
                        Ok(message) => message,
                        Err(e) => {
                            relay
                                .report(
                                    ErrorRecord::new(format!("unable to fetch message: {e}"))
                                        .with_metadata("stream", stream_name),
                                )
                                .await;
                            continue;
                        }
                    };

                    let envelope = JetstreamEnvelope::new(stream_name, &message);
                    let (message, relay) = (&message, &relay);
                    let delivery = relay
                        .deliver_then(&envelope, move || async move {
                            if let Err(e) = message.ack().await {
                                relay
                                    .report(ErrorRecord::new(format!("unable to ack message: {e}")))
                                    .await;
                            }
                        })
                        .await;
                    if delivery == Delivery::Closed {
                        return Ok(());
                    }
                }
                Err(BackendError::read(format!(
                    "consumer on stream '{stream_name}' closed"
                )))
            })
            .await;

        if let (Some(durable), false) = (&args.consumer_name, args.keep_consumer) {
            match stream.delete_consumer(durable).await {
                Ok(_) => debug!(backend = BACKEND_NAME, durable = %durable, "Deleted consumer"),
                Err(e) => warn!(
                    backend = BACKEND_NAME,
                    durable = %durable,
                    error = %e,
                    "Unable to delete consumer"
                ),
            }
        }
        result
    }

    async fn write(
        &mut self,
        ctx: &CancellationToken,
        options: &WriteOptions,
        errors: mpsc::Sender<ErrorRecord>,
        records: Vec<WriteRecord>,
    ) -> Result<(), BackendError> {
        let args = validate_write_options(options, &records)
            .map_err(|e| BackendError::validation(Operation::Write, e))?;
        self.context()?;

        publish::write_all(ctx, BACKEND_NAME, &args.subject, self, records, &errors).await
    }

    async fn tunnel(
        &mut self,
        ctx: &CancellationToken,
        options: &TunnelOptions,
        service: &mut dyn TunnelService,
        errors: mpsc::Sender<ErrorRecord>,
    ) -> Result<(), BackendError> {
        let args = validate_tunnel_options(options)
            .map_err(|e| BackendError::validation(Operation::Tunnel, e))?;
        self.context()?;

        tunnel::run(ctx, BACKEND_NAME, &args.subject, self, service, errors).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::BackendGroup;
    use crate::adapters::nats::tests::offline_client;
    use crate::test_utils::CountingHandle;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_close_twice() {
        let (handle, closes) = CountingHandle::new();
        let mut handles = HandleStack::new(BACKEND_NAME);
        handles.push(handle);
        let mut backend = NatsJetstream {
            context: Some(jetstream::new(offline_client().await)),
            handles,
        };
        let ctx = CancellationToken::new();

        backend.close(&ctx).await.unwrap();
        backend.close(&ctx).await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let options = WriteOptions {
            nats_jetstream: Some(BackendGroup::new(NatsJetstreamWriteArgs {
                subject: "orders.new".to_string(),
            })),
            ..WriteOptions::default()
        };
        let err = backend
            .write(&ctx, &options, mpsc::channel(1).0, vec![WriteRecord::new("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Closed));
    }

    fn read_options(args: NatsJetstreamReadArgs) -> ReadOptions {
        ReadOptions {
            nats_jetstream: Some(BackendGroup::new(args)),
            ..ReadOptions::default()
        }
    }

    #[test]
    fn test_read_requires_stream() {
        let options = read_options(NatsJetstreamReadArgs::default());
        assert_eq!(
            validate_read_options(&options).unwrap_err(),
            ValidationError::EmptyStream
        );
    }

    #[test]
    fn test_read_rejects_zero_start_sequence() {
        let options = read_options(NatsJetstreamReadArgs {
            stream: "ORDERS".to_string(),
            start_sequence: Some(0),
            ..NatsJetstreamReadArgs::default()
        });
        assert_eq!(
            validate_read_options(&options).unwrap_err(),
            ValidationError::InvalidStartSequence
        );
    }

    #[test]
    fn test_consumer_config() {
        let config = consumer_config(&NatsJetstreamReadArgs {
            stream: "ORDERS".to_string(),
            consumer_name: Some("audit".to_string()),
            filter_subject: Some("orders.eu".to_string()),
            start_sequence: Some(42),
            keep_consumer: false,
        });

        assert_eq!(config.durable_name.as_deref(), Some("audit"));
        assert_eq!(config.filter_subject, "orders.eu");
        assert!(matches!(
            config.deliver_policy,
            consumer::DeliverPolicy::ByStartSequence { start_sequence: 42 }
        ));
        assert!(matches!(config.ack_policy, consumer::AckPolicy::Explicit));

        let ephemeral = consumer_config(&NatsJetstreamReadArgs {
            stream: "ORDERS".to_string(),
            ..NatsJetstreamReadArgs::default()
        });
        assert!(ephemeral.durable_name.is_none());
        assert!(matches!(ephemeral.deliver_policy, consumer::DeliverPolicy::All));
    }

    #[test]
    fn test_tunnel_requires_subject() {
        let options = TunnelOptions {
            nats_jetstream: Some(BackendGroup::new(NatsJetstreamTunnelArgs::default())),
            ..TunnelOptions::default()
        };
        assert_eq!(
            validate_tunnel_options(&options).unwrap_err(),
            ValidationError::MissingSubject
        );
    }
}
