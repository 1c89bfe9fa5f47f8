//! MQTT over `rumqttc`
//!
//! The client library hands every packet to a single event loop. A driver
//! task owns that loop and forwards PUBLISH, SUBACK and CONNACK packets to
//! whichever read is active, blocking while the read's inbox is full. The
//! session is clean, so an active read resubscribes after every reconnect.

use crate::error::{BackendError, ConnectStep, Operation};
use crate::lifecycle::{Handle, HandleStack, TaskHandle};
use crate::publish::{self, Publisher};
use crate::relay::{Delivery, Envelope, Relay, SerializeFailure};
use crate::tunnel::{self, TunnelService};
use crate::{tls, validate, Backend};
use async_trait::async_trait;
use relay_types::{
    BackendRecord, ConnectionOptions, ErrorRecord, MqttConn, MqttReadArgs, MqttRecord,
    MqttTunnelArgs, MqttWriteArgs, ReadOptions, ReadRecord, TlsOptions, TunnelOptions,
    ValidationError, WriteOptions, WriteRecord,
};
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish,
    QoS, SubAck, SubscribeReasonCode, TlsConfiguration, Transport,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

pub const BACKEND_NAME: &str = "mqtt";

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;
const REQUEST_CAPACITY: usize = 64;
const INBOX_CAPACITY: usize = 256;
const MIN_KEEP_ALIVE_SECS: u64 = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Packets the driver hands to an active read
#[derive(Debug)]
enum Inbound {
    Publish(Publish),
    SubAck(SubAck),
    /// Only seen after a reconnect, the first CONNACK is consumed at connect
    ConnAck(ConnAck),
}

type Inbox = Arc<Mutex<Option<mpsc::Sender<Inbound>>>>;

#[derive(Debug)]
pub struct Mqtt {
    client: Option<AsyncClient>,
    qos: QoS,
    inbox: Inbox,
    handles: HandleStack,
}

impl Mqtt {
    pub async fn new(options: &ConnectionOptions) -> Result<Self, BackendError> {
        let args = validate_base_conn_opts(options)
            .map_err(|e| BackendError::validation(Operation::Connect, e))?;

        let qos = qos_level(args.qos_level)?;
        let mqtt_options = mqtt_options(args)?;
        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        wait_for_connack(&mut eventloop, Duration::from_secs(args.connect_timeout_secs)).await?;

        info!(backend = BACKEND_NAME, address = %args.address, "Connected to MQTT broker");
        Ok(Self::with_client(client, eventloop, qos))
    }

    /// Take over an already created client and start driving its event loop
    pub(crate) fn with_client(client: AsyncClient, eventloop: EventLoop, qos: QoS) -> Self {
        let inbox: Inbox = Arc::new(Mutex::new(None));
        let shutdown = CancellationToken::new();
        let driver = tokio::spawn(drive(eventloop, inbox.clone(), shutdown.clone()));

        let mut handles = HandleStack::new(BACKEND_NAME);
        handles.push(TaskHandle::new("mqtt-driver", shutdown, driver));
        handles.push(SessionHandle {
            client: Some(client.clone()),
        });

        Self {
            client: Some(client),
            qos,
            inbox,
            handles,
        }
    }

    fn client(&self) -> Result<&AsyncClient, BackendError> {
        self.client.as_ref().ok_or(BackendError::Closed)
    }

    async fn set_inbox(&self, sender: Option<mpsc::Sender<Inbound>>) {
        *self.inbox.lock().await = sender;
    }
}

fn qos_level(level: u8) -> Result<QoS, BackendError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(BackendError::validation(
            Operation::Connect,
            ValidationError::InvalidQos(other),
        )),
    }
}

fn validate_base_conn_opts(options: &ConnectionOptions) -> Result<&MqttConn, ValidationError> {
    let args = validate::require_conn(options, ConnectionOptions::mqtt)?;
    validate::non_empty(&args.address, ValidationError::EmptyAddress)?;
    if args.qos_level > 2 {
        return Err(ValidationError::InvalidQos(args.qos_level));
    }
    validate::connect_timeout(args.connect_timeout_secs)?;
    validate::tls(&args.tls)?;
    Ok(args)
}

fn validate_read_options(options: &ReadOptions) -> Result<&MqttReadArgs, ValidationError> {
    let args = validate::require_args(options.mqtt.as_ref())?;
    validate::non_empty(&args.topic, ValidationError::EmptyTopic)?;
    Ok(args)
}

fn validate_write_options<'a>(
    options: &'a WriteOptions,
    records: &[WriteRecord],
) -> Result<&'a MqttWriteArgs, ValidationError> {
    let args = validate::require_args(options.mqtt.as_ref())?;
    validate::non_empty(&args.topic, ValidationError::EmptyTopic)?;
    if records.is_empty() {
        return Err(ValidationError::NoWriteRecords);
    }
    Ok(args)
}

fn validate_tunnel_options(options: &TunnelOptions) -> Result<&MqttTunnelArgs, ValidationError> {
    let args = validate::require_args(options.mqtt.as_ref())?;
    validate::non_empty(&args.topic, ValidationError::EmptyTopic)?;
    Ok(args)
}

fn mqtt_options(args: &MqttConn) -> Result<MqttOptions, BackendError> {
    let uri = Url::parse(&args.address).map_err(|e| {
        BackendError::connect(
            ConnectStep::ParseAddress,
            format!("unable to parse address '{}': {e}", args.address),
        )
    })?;
    let host = uri.host_str().ok_or_else(|| {
        BackendError::connect(
            ConnectStep::ParseAddress,
            format!("address '{}' has no host", args.address),
        )
    })?;

    let secure = tls::wants_tls(uri.scheme(), &args.tls);
    let port = uri
        .port()
        .unwrap_or(if secure { DEFAULT_TLS_PORT } else { DEFAULT_PORT });
    let client_id = match &args.client_id {
        Some(id) if !id.trim().is_empty() => id.clone(),
        _ => format!("conduit-{}", Uuid::new_v4().simple()),
    };

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(Duration::from_secs(args.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS)));

    if !uri.username().is_empty() {
        options.set_credentials(uri.username(), uri.password().unwrap_or_default());
    }
    if secure {
        options.set_transport(transport(&args.tls)?);
    }
    Ok(options)
}

fn transport(options: &TlsOptions) -> Result<Transport, BackendError> {
    if options.skip_verify {
        return Err(BackendError::connect(
            ConnectStep::Tls,
            "skip_verify is not supported by the MQTT backend",
        ));
    }

    let Some(ca) = &options.ca_cert else {
        return Ok(Transport::tls_with_default_config());
    };
    let ca = ca
        .load_bytes()
        .map_err(|e| BackendError::connect(ConnectStep::Tls, e))?;

    let client_auth = match (&options.client_cert, &options.client_key) {
        (Some(cert), Some(key)) => {
            let cert = cert
                .load_bytes()
                .map_err(|e| BackendError::connect(ConnectStep::Tls, e))?;
            let key = key
                .load_bytes()
                .map_err(|e| BackendError::connect(ConnectStep::Tls, e))?;
            Some((cert, key))
        }
        _ => None,
    };

    Ok(Transport::tls_with_config(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }))
}

async fn wait_for_connack(eventloop: &mut EventLoop, timeout: Duration) -> Result<(), BackendError> {
    let handshake = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        return Ok(());
                    }
                    return Err(BackendError::connect(
                        ConnectStep::Session,
                        format!("broker refused connection: {:?}", ack.code),
                    ));
                }
                Ok(_) => continue,
                Err(e) => {
                    return Err(BackendError::connect(
                        ConnectStep::Transport,
                        format!("unable to connect to MQTT broker: {e}"),
                    ))
                }
            }
        }
    };

    tokio::time::timeout(timeout, handshake).await.map_err(|_| {
        BackendError::connect(
            ConnectStep::Transport,
            format!("no CONNACK within {:?}", timeout),
        )
    })?
}

async fn drive(mut eventloop: EventLoop, inbox: Inbox, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                forward(&inbox, Inbound::Publish(publish)).await
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => forward(&inbox, Inbound::SubAck(ack)).await,
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!(backend = BACKEND_NAME, session_present = ack.session_present, "Reconnected");
                forward(&inbox, Inbound::ConnAck(ack)).await
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(backend = BACKEND_NAME, "Disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(backend = BACKEND_NAME, error = %e, "MQTT connection error, reconnecting");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    debug!(backend = BACKEND_NAME, "Event loop driver stopped");
}

async fn forward(inbox: &Inbox, packet: Inbound) {
    let sender = inbox.lock().await.clone();
    match sender {
        Some(sender) => {
            if sender.send(packet).await.is_err() {
                trace!(backend = BACKEND_NAME, "Read ended, dropping packet");
            }
        }
        None => trace!(backend = BACKEND_NAME, "No active read, dropping packet"),
    }
}

/// Feed inbox packets into `relay` until the subscription fails, the event
/// loop stops or the caller stops listening
async fn pump<F, Fut>(
    topic: &str,
    relay: &Relay,
    inbox: &mut mpsc::Receiver<Inbound>,
    mut resubscribe: F,
) -> Result<(), BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), BackendError>>,
{
    while let Some(packet) = inbox.recv().await {
        match packet {
            Inbound::SubAck(ack) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                if rejected {
                    return Err(BackendError::subscribe(
                        topic,
                        "broker rejected the subscription",
                    ));
                }
                debug!(backend = BACKEND_NAME, topic, "Subscription acknowledged");
            }
            Inbound::ConnAck(ack) => {
                if !ack.session_present {
                    info!(backend = BACKEND_NAME, topic, "Session lost on reconnect, resubscribing");
                    resubscribe().await?;
                }
            }
            Inbound::Publish(publish) => {
                let envelope = MqttEnvelope::from(publish);
                if relay.deliver(&envelope).await == Delivery::Closed {
                    return Ok(());
                }
            }
        }
    }
    Err(BackendError::read("MQTT event loop stopped"))
}

/// Sends DISCONNECT so the broker drops the session cleanly
struct SessionHandle {
    client: Option<AsyncClient>,
}

#[async_trait]
impl Handle for SessionHandle {
    fn label(&self) -> &'static str {
        "mqtt-session"
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        client
            .disconnect()
            .await
            .map_err(|e| BackendError::close(self.label(), e))
    }
}

/// JSON snapshot of a PUBLISH packet
#[derive(Debug, Serialize)]
struct MqttEnvelope {
    topic: String,
    pkid: u16,
    qos: u8,
    dup: bool,
    retain: bool,
    payload: Vec<u8>,
}

impl From<Publish> for MqttEnvelope {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            pkid: publish.pkid,
            qos: publish.qos as u8,
            dup: publish.dup,
            retain: publish.retain,
            payload: publish.payload.to_vec(),
        }
    }
}

impl Envelope for MqttEnvelope {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn to_record(&self, received_at: i64) -> BackendRecord {
        BackendRecord::Mqtt(MqttRecord {
            id: u32::from(self.pkid),
            topic: self.topic.clone(),
            value: self.payload.clone(),
            duplicate: self.dup,
            retained: self.retain,
            qos: u32::from(self.qos),
            timestamp: received_at,
        })
    }
}

/// Publishes at the connection QoS with a fixed retain flag
struct MqttPublisher<'a> {
    client: &'a AsyncClient,
    qos: QoS,
    retain: bool,
}

#[async_trait]
impl Publisher for MqttPublisher<'_> {
    async fn publish(
        &mut self,
        destination: &str,
        payload: &[u8],
        _headers: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        self.client
            .publish(destination, self.qos, self.retain, payload.to_vec())
            .await
            .map_err(|e| BackendError::publish(destination, e))
    }
}

#[async_trait]
impl Backend for Mqtt {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn test(&mut self, _ctx: &CancellationToken) -> Result<(), BackendError> {
        Err(BackendError::NotImplemented)
    }

    async fn close(&mut self, _ctx: &CancellationToken) -> Result<(), BackendError> {
        self.client = None;
        self.set_inbox(None).await;
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
        let topic = args.topic.as_str();
        let client = self.client()?.clone();

        let (inbox_tx, mut inbox) = mpsc::channel(INBOX_CAPACITY);
        self.set_inbox(Some(inbox_tx)).await;

        if let Err(e) = client.subscribe(topic, self.qos).await {
            self.set_inbox(None).await;
            return Err(BackendError::subscribe(topic, e));
        }

        let relay = Relay::new(
            BACKEND_NAME,
            options.continuous,
            SerializeFailure::Continue,
            results,
            errors,
        );

        let qos = self.qos;
        let resubscribe = || {
            let client = client.clone();
            async move {
                client
                    .subscribe(topic, qos)
                    .await
                    .map_err(|e| BackendError::subscribe(topic, e))
            }
        };
        let result = relay
            .run(ctx, pump(topic, &relay, &mut inbox, resubscribe))
            .await;

        self.set_inbox(None).await;
        if let Err(e) = client.unsubscribe(topic).await {
            debug!(backend = BACKEND_NAME, topic, error = %e, "Unable to unsubscribe");
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

        let mut publisher = MqttPublisher {
            client: self.client()?,
            qos: self.qos,
            retain: args.retain,
        };
        publish::write_all(ctx, BACKEND_NAME, &args.topic, &mut publisher, records, &errors).await
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

        let mut publisher = MqttPublisher {
            client: self.client()?,
            qos: self.qos,
            retain: false,
        };
        tunnel::run(ctx, BACKEND_NAME, &args.topic, &mut publisher, service, errors).await
    }
}
