//! Core NATS publish/subscribe

use super::nats_conn::{self, ConnectionHandle};
use crate::error::{BackendError, Operation};
use crate::lifecycle::HandleStack;
use crate::publish::{self, Publisher};
use crate::relay::{Delivery, Envelope, Relay, SerializeFailure};
use crate::tunnel::{self, TunnelService};
use crate::{validate, Backend};
use async_nats::Client;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use relay_types::{
    BackendRecord, ConnectionOptions, ErrorRecord, NatsConn, NatsReadArgs, NatsRecord,
    NatsTunnelArgs, NatsWriteArgs, ReadOptions, ReadRecord, TunnelOptions, ValidationError,
    WriteOptions, WriteRecord,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const BACKEND_NAME: &str = "nats";

#[derive(Debug)]
pub struct Nats {
    client: Option<Client>,
    handles: HandleStack,
}

impl Nats {
    pub async fn new(options: &ConnectionOptions) -> Result<Self, BackendError> {
        let args = validate_base_conn_opts(options)
            .map_err(|e| BackendError::validation(Operation::Connect, e))?;

        let client = nats_conn::connect(BACKEND_NAME, args).await?;
        let mut handles = HandleStack::new(BACKEND_NAME);
        handles.push(ConnectionHandle::new(client.clone()));

        Ok(Self {
            client: Some(client),
            handles,
        })
    }

    fn client(&self) -> Result<&Client, BackendError> {
        self.client.as_ref().ok_or(BackendError::Closed)
    }
}

fn validate_base_conn_opts(options: &ConnectionOptions) -> Result<&NatsConn, ValidationError> {
    let args = validate::require_conn(options, ConnectionOptions::nats)?;
    nats_conn::validate_conn(args)?;
    Ok(args)
}

fn validate_read_options(options: &ReadOptions) -> Result<&NatsReadArgs, ValidationError> {
    let args = validate::require_args(options.nats.as_ref())?;
    validate::non_empty(&args.subject, ValidationError::MissingSubject)?;
    Ok(args)
}

fn validate_write_options<'a>(
    options: &'a WriteOptions,
    records: &[WriteRecord],
) -> Result<&'a NatsWriteArgs, ValidationError> {
    let args = validate::require_args(options.nats.as_ref())?;
    validate::non_empty(&args.subject, ValidationError::MissingSubject)?;
    if records.is_empty() {
        return Err(ValidationError::NoWriteRecords);
    }
    Ok(args)
}

fn validate_tunnel_options(options: &TunnelOptions) -> Result<&NatsTunnelArgs, ValidationError> {
    let args = validate::require_args(options.nats.as_ref())?;
    validate::non_empty(&args.subject, ValidationError::MissingSubject)?;
    Ok(args)
}

/// JSON snapshot of a core NATS message
#[derive(Debug, Serialize)]
struct NatsEnvelope {
    subject: String,
    reply: Option<String>,
    headers: BTreeMap<String, String>,
    data: Vec<u8>,
    length: usize,
}

impl NatsEnvelope {
    fn from_message(message: &async_nats::Message) -> Self {
        Self {
            subject: message.subject.to_string(),
            reply: message.reply.as_ref().map(|r| r.to_string()),
            headers: nats_conn::from_header_map(message.headers.as_ref()),
            data: message.payload.to_vec(),
            length: message.length,
        }
    }
}

impl Envelope for NatsEnvelope {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    fn to_record(&self, _received_at: i64) -> BackendRecord {
        BackendRecord::Nats(NatsRecord {
            subject: self.subject.clone(),
            value: self.data.clone(),
            headers: self.headers.clone(),
        })
    }
}

#[async_trait]
impl Publisher for Nats {
    async fn publish(
        &mut self,
        destination: &str,
        payload: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        let client = self.client()?;
        let payload = Bytes::copy_from_slice(payload);

        let result = match nats_conn::to_header_map(headers) {
            Some(headers) => {
                client
                    .publish_with_headers(destination.to_string(), headers, payload)
                    .await
            }
            None => client.publish(destination.to_string(), payload).await,
        };
        result.map_err(|e| BackendError::publish(destination, e))
    }
}

#[async_trait]
impl Backend for Nats {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn test(&mut self, _ctx: &CancellationToken) -> Result<(), BackendError> {
        self.client()?
            .flush()
            .await
            .map_err(|e| BackendError::HealthCheck(e.to_string()))
    }

    async fn close(&mut self, _ctx: &CancellationToken) -> Result<(), BackendError> {
        self.client = None;
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
        let subject = args.subject.as_str();

        let mut subscriber = self
            .client()?
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BackendError::subscribe(subject, e))?;

        let relay = Relay::new(
            BACKEND_NAME,
            options.continuous,
            SerializeFailure::Skip,
            results,
            errors,
        );

        let result = relay
            .run(ctx, async {
                while let Some(message) = subscriber.next().await {
                    let delivery = relay.deliver(&NatsEnvelope::from_message(&message)).await;
                    if delivery == Delivery::Closed {
                        return Ok(());
                    }
                }
                Err(BackendError::read(format!("subscription to '{subject}' closed")))
            })
            .await;

        if let Err(e) = subscriber.unsubscribe().await {
            debug!(backend = BACKEND_NAME, subject, error = %e, "Unable to unsubscribe");
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
        self.client()?;

        publish::write_all(ctx, BACKEND_NAME, &args.subject, self, records, &errors).await?;

        self.client()?
            .flush()
            .await
            .map_err(|e| BackendError::publish(args.subject.as_str(), e))
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
        self.client()?;

        tunnel::run(ctx, BACKEND_NAME, &args.subject, self, service, errors).await
    }
}
