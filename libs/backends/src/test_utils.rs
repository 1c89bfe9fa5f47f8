use crate::lifecycle::Handle;
use crate::relay::Envelope;
use crate::tunnel::TunnelService;
use crate::BackendError;
use async_trait::async_trait;
use relay_types::{BackendRecord, ErrorRecord, MqttRecord, TunnelOutboundRecord};
use serde::ser::{Error as _, SerializeStruct};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use crate::tunnel::ChannelTunnel;

/// Envelope with a controllable JSON snapshot
#[derive(Debug, Clone)]
pub struct TestEnvelope {
    pub topic: String,
    pub payload: Vec<u8>,
    fail_serialize: bool,
}

impl TestEnvelope {
    pub fn new(topic: &str, payload: &[u8]) -> Self {
        Self {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            fail_serialize: false,
        }
    }

    /// An envelope whose serialization always fails
    pub fn unserializable(topic: &str, payload: &[u8]) -> Self {
        Self {
            fail_serialize: true,
            ..Self::new(topic, payload)
        }
    }
}

impl Serialize for TestEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.fail_serialize {
            return Err(S::Error::custom("envelope refuses to serialize"));
        }
        let mut state = serializer.serialize_struct("TestEnvelope", 2)?;
        state.serialize_field("topic", &self.topic)?;
        state.serialize_field("payload", &self.payload)?;
        state.end()
    }
}

impl Envelope for TestEnvelope {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn to_record(&self, received_at: i64) -> BackendRecord {
        BackendRecord::Mqtt(MqttRecord {
            id: 0,
            topic: self.topic.clone(),
            value: self.payload.clone(),
            duplicate: false,
            retained: false,
            qos: 0,
            timestamp: received_at,
        })
    }
}

/// One call recorded by [`FlakyPublisher`]
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub destination: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

/// A publisher that records payloads and fails on chosen calls
#[derive(Debug, Default)]
pub struct FlakyPublisher {
    calls: usize,
    fail_at: HashSet<usize>,
    published: Vec<Published>,
}

impl FlakyPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the calls at these zero-based positions
    pub fn failing_at(calls: impl IntoIterator<Item = usize>) -> Self {
        Self {
            fail_at: calls.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn published(&self) -> &[Published] {
        &self.published
    }

    pub fn published_payloads(&self) -> Vec<Vec<u8>> {
        self.published.iter().map(|p| p.payload.clone()).collect()
    }
}

#[async_trait]
impl crate::publish::Publisher for FlakyPublisher {
    async fn publish(
        &mut self,
        destination: &str,
        payload: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        let call = self.calls;
        self.calls += 1;

        if self.fail_at.contains(&call) {
            return Err(BackendError::publish(destination, "simulated failure"));
        }

        self.published.push(Published {
            destination: destination.to_string(),
            payload: payload.to_vec(),
            headers: headers.clone(),
        });
        Ok(())
    }
}

/// A tunnel service that cannot be started
#[derive(Debug)]
pub struct FailingTunnel {
    message: String,
}

impl FailingTunnel {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl TunnelService for FailingTunnel {
    async fn start(
        &mut self,
        _ctx: &CancellationToken,
        _backend_label: &str,
        _errors: mpsc::Sender<ErrorRecord>,
    ) -> Result<(), BackendError> {
        Err(BackendError::Tunnel(self.message.clone()))
    }

    fn read(&mut self) -> Option<mpsc::Receiver<TunnelOutboundRecord>> {
        None
    }
}

/// A handle that counts how often it was closed
#[derive(Debug)]
pub struct CountingHandle {
    closes: Arc<AtomicUsize>,
}

impl CountingHandle {
    /// The handle and a counter that outlives it
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        (
            Self {
                closes: closes.clone(),
            },
            closes,
        )
    }
}

#[async_trait]
impl Handle for CountingHandle {
    fn label(&self) -> &'static str {
        "counting"
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
