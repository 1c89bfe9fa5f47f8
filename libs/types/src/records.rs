//! Canonical records exchanged between backends and their callers
//!
//! Every backend normalizes broker-native deliveries into [`ReadRecord`]s and
//! reports non-fatal per-message failures as [`ErrorRecord`]s. Replay input
//! arrives as [`TunnelOutboundRecord`]s, and callers hand [`WriteRecord`]s to
//! a backend for publishing.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Current wall-clock time as UTC Unix seconds
pub fn unix_ts_utc() -> i64 {
    Utc::now().timestamp()
}

/// One normalized inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadRecord {
    /// Unique identifier generated when the record is built
    pub message_id: String,

    /// Position of this record within a single read call, starting at 1
    pub num: i64,

    /// When the relay received the message (UTC Unix seconds)
    pub received_at_unix_ts_utc: i64,

    /// Raw payload exactly as delivered by the broker
    pub payload: Vec<u8>,

    /// JSON snapshot of the broker-native envelope, absent if it failed to serialize
    pub raw: Option<Vec<u8>>,

    /// Protocol specific fields
    pub record: BackendRecord,
}

impl ReadRecord {
    /// Build a record with a fresh message id
    pub fn new(
        num: i64,
        received_at_unix_ts_utc: i64,
        payload: Vec<u8>,
        raw: Option<Vec<u8>>,
        record: BackendRecord,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            num,
            received_at_unix_ts_utc,
            payload,
            raw,
            record,
        }
    }

    /// Backend label of the variant payload
    pub fn backend(&self) -> &'static str {
        self.record.backend()
    }
}

/// Broker specific part of a [`ReadRecord`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum BackendRecord {
    Mqtt(MqttRecord),
    Nats(NatsRecord),
    NatsStreaming(NatsStreamingRecord),
    NatsJetstream(NatsJetstreamRecord),
}

impl BackendRecord {
    pub fn backend(&self) -> &'static str {
        match self {
            BackendRecord::Mqtt(_) => "mqtt",
            BackendRecord::Nats(_) => "nats",
            BackendRecord::NatsStreaming(_) => "nats-streaming",
            BackendRecord::NatsJetstream(_) => "nats-jetstream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttRecord {
    /// Packet identifier (0 for QoS 0 deliveries)
    pub id: u32,
    pub topic: String,
    pub value: Vec<u8>,
    pub duplicate: bool,
    pub retained: bool,
    pub qos: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatsRecord {
    pub subject: String,
    pub value: Vec<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatsStreamingRecord {
    pub sequence: u64,
    pub subject: String,
    pub value: Vec<u8>,
    /// Server timestamp in nanoseconds
    pub timestamp_ns: i64,
    pub redelivered: bool,
    pub redelivery_count: u32,
    pub crc32: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatsJetstreamRecord {
    pub stream: String,
    pub consumer_name: String,
    pub subject: String,
    pub value: Vec<u8>,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// One normalized, non-fatal failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub occurred_at_unix_ts_utc: i64,
    pub error: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ErrorRecord {
    /// Create an error record stamped with the current time
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            occurred_at_unix_ts_utc: unix_ts_utc(),
            error: error.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a diagnostic key/value pair
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Replay payload handed to a backend by an external tunnel service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelOutboundRecord {
    pub blob: Vec<u8>,
    pub replay_id: String,
}

impl TunnelOutboundRecord {
    pub fn new(blob: impl Into<Vec<u8>>, replay_id: impl Into<String>) -> Self {
        Self {
            blob: blob.into(),
            replay_id: replay_id.into(),
        }
    }
}

/// Message a caller asks a backend to publish
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub input: Vec<u8>,
    /// Only honored by backends with header support (NATS, JetStream)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl WriteRecord {
    pub fn new(input: impl Into<Vec<u8>>) -> Self {
        Self {
            input: input.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mqtt_record() -> BackendRecord {
        BackendRecord::Mqtt(MqttRecord {
            id: 7,
            topic: "sensors/a".to_string(),
            value: b"42".to_vec(),
            duplicate: false,
            retained: true,
            qos: 1,
            timestamp: 1_700_000_000,
        })
    }

    #[test]
    fn test_read_record_ids_are_unique() {
        let a = ReadRecord::new(1, 0, b"x".to_vec(), None, mqtt_record());
        let b = ReadRecord::new(2, 0, b"x".to_vec(), None, mqtt_record());

        assert_ne!(a.message_id, b.message_id);
        assert!(Uuid::parse_str(&a.message_id).is_ok());
        assert_eq!(a.backend(), "mqtt");
    }

    #[test]
    fn test_backend_record_is_tagged() {
        let json = serde_json::to_value(mqtt_record()).unwrap();
        assert_eq!(json["backend"], "mqtt");
        assert_eq!(json["topic"], "sensors/a");

        let nats = BackendRecord::Nats(NatsRecord {
            subject: "orders".to_string(),
            value: vec![],
            headers: BTreeMap::new(),
        });
        let json = serde_json::to_value(&nats).unwrap();
        assert_eq!(json["backend"], "nats");
        assert!(json.get("headers").is_none());
    }

    #[test]
    fn test_error_record_metadata() {
        let record = ErrorRecord::new("boom").with_metadata("replay_id", "r-1");

        assert_eq!(record.error, "boom");
        assert_eq!(record.metadata.get("replay_id").map(String::as_str), Some("r-1"));
        assert!(record.occurred_at_unix_ts_utc > 0);
    }
}
