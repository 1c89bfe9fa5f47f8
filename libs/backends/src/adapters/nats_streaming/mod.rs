//! NATS Streaming (STAN) on top of a NATS connection

mod proto;
mod session;

use self::proto::{MsgProto, StartPosition, SubscriptionRequest};
use self::session::{SessionHandle, StanSession};
use super::nats_conn::{self, ConnectionHandle};
use crate::error::{BackendError, Operation};
use crate::lifecycle::HandleStack;
use crate::publish::{self, Publisher};
use crate::relay::{Delivery, Envelope, Relay, SerializeFailure};
use crate::tunnel::{self, TunnelService};
use crate::{validate, Backend};
use async_nats::Client;
use async_trait::async_trait;
use relay_types::{
    BackendRecord, ConnectionOptions, ErrorRecord, NatsStreamingConn, NatsStreamingReadArgs,
    NatsStreamingRecord, NatsStreamingTunnelArgs, NatsStreamingWriteArgs, ReadOptions,
    ReadRecord, TunnelOptions, ValidationError, WriteOptions, WriteRecord,
};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const BACKEND_NAME: &str = "nats-streaming";

const NANOS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug)]
pub struct NatsStreaming {
    session: Option<StanSession>,
    handles: HandleStack,
}

impl NatsStreaming {
    pub async fn new(options: &ConnectionOptions) -> Result<Self, BackendError> {
        let args = validate_base_conn_opts(options)
            .map_err(|e| BackendError::validation(Operation::Connect, e))?;

        let client = nats_conn::connect(BACKEND_NAME, &args.nats).await?;
        let mut handles = HandleStack::new(BACKEND_NAME);
        handles.push(ConnectionHandle::new(client.clone()));

        let session = match open_session(&client, args, &mut handles).await {
            Ok(session) => session,
            Err(e) => {
                if let Err(close_err) = handles.close_all().await {
                    warn!(
                        backend = BACKEND_NAME,
                        error = %close_err,
                        "Unable to release partial connection"
                    );
                }
                return Err(e);
            }
        };

        info!(
            backend = BACKEND_NAME,
            cluster_id = %args.cluster_id,
            client_id = %args.client_id,
            "Connected to streaming cluster"
        );
        Ok(Self {
            session: Some(session),
            handles,
        })
    }

    fn session(&self) -> Result<&StanSession, BackendError> {
        self.session.as_ref().ok_or(BackendError::Closed)
    }
}

async fn open_session(
    client: &Client,
    args: &NatsStreamingConn,
    handles: &mut HandleStack,
) -> Result<StanSession, BackendError> {
    let (heartbeat_inbox, heartbeat) = session::spawn_heartbeat(client).await?;
    handles.push(heartbeat);

    let session =
        StanSession::connect(client, &args.cluster_id, &args.client_id, heartbeat_inbox).await?;
    handles.push(SessionHandle::new(session.clone()));
    Ok(session)
}

fn validate_base_conn_opts(options: &ConnectionOptions) -> Result<&NatsStreamingConn, ValidationError> {
    let args = validate::require_conn(options, ConnectionOptions::nats_streaming)?;
    nats_conn::validate_conn(&args.nats)?;
    validate::non_empty(&args.cluster_id, ValidationError::EmptyClusterId)?;
    validate::non_empty(&args.client_id, ValidationError::EmptyClientId)?;
    Ok(args)
}

fn validate_read_options(options: &ReadOptions) -> Result<&NatsStreamingReadArgs, ValidationError> {
    let args = validate::require_args(options.nats_streaming.as_ref())?;
    validate::non_empty(&args.channel, ValidationError::EmptyChannel)?;

    let start_options = [
        args.read_last,
        args.read_all,
        args.read_sequence_number.is_some(),
        args.read_since_secs.is_some(),
    ];
    if start_options.iter().filter(|set| **set).count() > 1 {
        return Err(ValidationError::InvalidReadOption);
    }
    Ok(args)
}

fn validate_write_options<'a>(
    options: &'a WriteOptions,
    records: &[WriteRecord],
) -> Result<&'a NatsStreamingWriteArgs, ValidationError> {
    let args = validate::require_args(options.nats_streaming.as_ref())?;
    validate::non_empty(&args.channel, ValidationError::EmptyChannel)?;
    if records.is_empty() {
        return Err(ValidationError::NoWriteRecords);
    }
    Ok(args)
}

fn validate_tunnel_options(
    options: &TunnelOptions,
) -> Result<&NatsStreamingTunnelArgs, ValidationError> {
    let args = validate::require_args(options.nats_streaming.as_ref())?;
    validate::non_empty(&args.channel, ValidationError::EmptyChannel)?;
    Ok(args)
}

fn subscription_request(args: &NatsStreamingReadArgs) -> SubscriptionRequest {
    let mut request = SubscriptionRequest {
        subject: args.channel.clone(),
        max_in_flight: args.max_in_flight,
        ack_wait_in_secs: args.ack_wait_secs,
        durable_name: args.durable_name.clone().unwrap_or_default(),
        start_position: StartPosition::NewOnly as i32,
        ..Default::default()
    };

    if args.read_all {
        request.start_position = StartPosition::First as i32;
    } else if args.read_last {
        request.start_position = StartPosition::LastReceived as i32;
    } else if let Some(sequence) = args.read_sequence_number {
        request.start_position = StartPosition::SequenceStart as i32;
        request.start_sequence = sequence;
    } else if let Some(secs) = args.read_since_secs {
        request.start_position = StartPosition::TimeDeltaStart as i32;
        request.start_time_delta = i64::try_from(secs)
            .unwrap_or(i64::MAX / NANOS_PER_SEC)
            .saturating_mul(NANOS_PER_SEC);
    }
    request
}

impl Envelope for MsgProto {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    fn to_record(&self, _received_at: i64) -> BackendRecord {
        BackendRecord::NatsStreaming(NatsStreamingRecord {
            sequence: self.sequence,
            subject: self.subject.clone(),
            value: self.data.clone(),
            timestamp_ns: self.timestamp,
            redelivered: self.redelivered,
            redelivery_count: self.redelivery_count,
            crc32: self.crc32,
        })
    }
}

#[async_trait]
impl Publisher for NatsStreaming {
    async fn publish(
        &mut self,
        destination: &str,
        payload: &[u8],
        _headers: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        self.session()?.publish(destination, payload).await
    }
}

#[async_trait]
impl Backend for NatsStreaming {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn test(&mut self, _ctx: &CancellationToken) -> Result<(), BackendError> {
        Err(BackendError::NotImplemented)
    }

    async fn close(&mut self, _ctx: &CancellationToken) -> Result<(), BackendError> {
        self.session = None;
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
        let channel = args.channel.as_str();

        let mut subscription = self.session()?.subscribe(subscription_request(args)).await?;

        let relay = Relay::new(
            BACKEND_NAME,
            options.continuous,
            SerializeFailure::Continue,
            results,
            errors,
        );

        let result = relay
            .run(ctx, async {
                while let Some(next) = subscription.next().await {
                    let message = match next {
                        Ok(message) => message,
                        Err(e) => {
                            relay
                                .report(
                                    ErrorRecord::new(format!("unable to decode message: {e}"))
                                        .with_metadata("channel", channel),
                                )
                                .await;
                            continue;
                        }
                    };

                    let (message, relay, subscription) = (&message, &relay, &subscription);
                    let delivery = relay
                        .deliver_then(message, move || async move {
                            if let Err(e) = subscription.ack(message).await {
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
                    "subscription to channel '{channel}' closed"
                )))
            })
            .await;

        if let Err(e) = subscription.close().await {
            debug!(backend = BACKEND_NAME, channel, error = %e, "Unable to close subscription");
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
        self.session()?;

        publish::write_all(ctx, BACKEND_NAME, &args.channel, self, records, &errors).await
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
        self.session()?;

        tunnel::run(ctx, BACKEND_NAME, &args.channel, self, service, errors).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::{BackendGroup, ConnectionArgs, NatsConn};
    use crate::test_utils::CountingHandle;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_close_twice() {
        let (connection, connection_closes) = CountingHandle::new();
        let (session, session_closes) = CountingHandle::new();
        let mut handles = HandleStack::new(BACKEND_NAME);
        handles.push(connection);
        handles.push(session);
        let mut backend = NatsStreaming {
            session: None,
            handles,
        };
        let ctx = CancellationToken::new();

        backend.close(&ctx).await.unwrap();
        backend.close(&ctx).await.unwrap();
        assert_eq!(connection_closes.load(Ordering::SeqCst), 1);
        assert_eq!(session_closes.load(Ordering::SeqCst), 1);

        let options = WriteOptions {
            nats_streaming: Some(BackendGroup::new(NatsStreamingWriteArgs {
                channel: "orders".to_string(),
            })),
            ..WriteOptions::default()
        };
        let err = backend
            .write(&ctx, &options, mpsc::channel(1).0, vec![WriteRecord::new("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Closed));
    }

    fn read_options(args: NatsStreamingReadArgs) -> ReadOptions {
        ReadOptions {
            nats_streaming: Some(BackendGroup::new(args)),
            ..ReadOptions::default()
        }
    }

    #[test]
    fn test_conn_requires_cluster_and_client() {
        let mut conn = NatsStreamingConn {
            nats: NatsConn::new("nats://localhost:4222"),
            cluster_id: String::new(),
            client_id: "conduit".to_string(),
        };
        let options = ConnectionOptions::new("stan", ConnectionArgs::NatsStreaming(conn.clone()));
        assert_eq!(
            validate_base_conn_opts(&options).unwrap_err(),
            ValidationError::EmptyClusterId
        );

        conn.cluster_id = "test-cluster".to_string();
        conn.client_id = " ".to_string();
        let options = ConnectionOptions::new("stan", ConnectionArgs::NatsStreaming(conn));
        assert_eq!(
            validate_base_conn_opts(&options).unwrap_err(),
            ValidationError::EmptyClientId
        );
    }

    #[test]
    fn test_only_one_start_position() {
        let mut args = NatsStreamingReadArgs::new("orders");
        args.read_all = true;
        args.read_sequence_number = Some(3);

        assert_eq!(
            validate_read_options(&read_options(args)).unwrap_err(),
            ValidationError::InvalidReadOption
        );
    }

    #[test]
    fn test_read_requires_channel() {
        assert_eq!(
            validate_read_options(&read_options(NatsStreamingReadArgs::new(""))).unwrap_err(),
            ValidationError::EmptyChannel
        );
    }

    #[test]
    fn test_subscription_request_start_positions() {
        let request = subscription_request(&NatsStreamingReadArgs::new("orders"));
        assert_eq!(request.start_position(), StartPosition::NewOnly);
        assert_eq!(request.max_in_flight, relay_types::DEFAULT_STAN_MAX_IN_FLIGHT);

        let mut args = NatsStreamingReadArgs::new("orders");
        args.read_sequence_number = Some(42);
        args.durable_name = Some("audit".to_string());
        let request = subscription_request(&args);
        assert_eq!(request.start_position(), StartPosition::SequenceStart);
        assert_eq!(request.start_sequence, 42);
        assert_eq!(request.durable_name, "audit");

        let mut args = NatsStreamingReadArgs::new("orders");
        args.read_since_secs = Some(60);
        let request = subscription_request(&args);
        assert_eq!(request.start_position(), StartPosition::TimeDeltaStart);
        assert_eq!(request.start_time_delta, 60 * NANOS_PER_SEC);

        let mut args = NatsStreamingReadArgs::new("orders");
        args.read_last = true;
        assert_eq!(
            subscription_request(&args).start_position(),
            StartPosition::LastReceived
        );
    }

    #[test]
    fn test_msg_proto_record() {
        let message = MsgProto {
            sequence: 7,
            subject: "orders".to_string(),
            data: vec![1, 2, 3],
            timestamp: 1_700_000_000_000_000_000,
            redelivered: true,
            redelivery_count: 2,
            ..Default::default()
        };

        assert_eq!(message.payload(), &[1, 2, 3]);
        assert!(serde_json::to_vec(&message).is_ok());
        match message.to_record(0) {
            BackendRecord::NatsStreaming(record) => {
                assert_eq!(record.sequence, 7);
                assert_eq!(record.timestamp_ns, 1_700_000_000_000_000_000);
                assert_eq!(record.redelivery_count, 2);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }
}
