//! Caller supplied configuration trees
//!
//! Each operation takes an options value holding one optional group per
//! backend, and each group holds optional `args`. Both levels are optional so
//! structural validation can report which one is missing before any network
//! activity happens.

use crate::material::Material;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MQTT_KEEP_ALIVE_SECS: u64 = 30;
pub const DEFAULT_STAN_MAX_IN_FLIGHT: i32 = 1024;
pub const DEFAULT_STAN_ACK_WAIT_SECS: i32 = 30;

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_keep_alive_secs() -> u64 {
    DEFAULT_MQTT_KEEP_ALIVE_SECS
}

fn default_max_in_flight() -> i32 {
    DEFAULT_STAN_MAX_IN_FLIGHT
}

fn default_ack_wait_secs() -> i32 {
    DEFAULT_STAN_ACK_WAIT_SECS
}

/// Per-backend group within an operation's options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendGroup<A> {
    pub args: Option<A>,
}

impl<A> BackendGroup<A> {
    pub fn new(args: A) -> Self {
        Self { args: Some(args) }
    }

    pub fn empty() -> Self {
        Self { args: None }
    }
}

/// A named connection to a broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    pub name: String,
    #[serde(default)]
    pub notes: String,
    pub conn: Option<ConnectionArgs>,
}

impl ConnectionOptions {
    pub fn new(name: impl Into<String>, conn: ConnectionArgs) -> Self {
        Self {
            name: name.into(),
            notes: String::new(),
            conn: Some(conn),
        }
    }

    pub fn mqtt(&self) -> Option<&MqttConn> {
        match &self.conn {
            Some(ConnectionArgs::Mqtt(args)) => Some(args),
            _ => None,
        }
    }

    pub fn nats(&self) -> Option<&NatsConn> {
        match &self.conn {
            Some(ConnectionArgs::Nats(args)) => Some(args),
            _ => None,
        }
    }

    pub fn nats_streaming(&self) -> Option<&NatsStreamingConn> {
        match &self.conn {
            Some(ConnectionArgs::NatsStreaming(args)) => Some(args),
            _ => None,
        }
    }

    pub fn nats_jetstream(&self) -> Option<&NatsJetstreamConn> {
        match &self.conn {
            Some(ConnectionArgs::NatsJetstream(args)) => Some(args),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ConnectionArgs {
    Mqtt(MqttConn),
    Nats(NatsConn),
    NatsStreaming(NatsStreamingConn),
    NatsJetstream(NatsJetstreamConn),
}

impl ConnectionArgs {
    /// Backend label this connection targets
    pub fn backend(&self) -> &'static str {
        match self {
            ConnectionArgs::Mqtt(_) => "mqtt",
            ConnectionArgs::Nats(_) => "nats",
            ConnectionArgs::NatsStreaming(_) => "nats-streaming",
            ConnectionArgs::NatsJetstream(_) => "nats-jetstream",
        }
    }
}

/// TLS settings shared by every backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Force TLS even when the address scheme is plaintext
    #[serde(default)]
    pub use_tls: bool,
    pub ca_cert: Option<Material>,
    pub client_cert: Option<Material>,
    pub client_key: Option<Material>,
    #[serde(default)]
    pub skip_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConn {
    /// e.g. `tcp://localhost:1883` or `ssl://broker:8883`
    pub address: String,
    pub client_id: Option<String>,
    #[serde(default)]
    pub qos_level: u8,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub tls: TlsOptions,
}

impl MqttConn {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            client_id: None,
            qos_level: 0,
            keep_alive_secs: DEFAULT_MQTT_KEEP_ALIVE_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            tls: TlsOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatsConn {
    /// e.g. `nats://localhost:4222` or `tls://demo.nats.io:4443`
    pub dsn: String,
    pub user_credentials: Option<Material>,
    #[serde(default)]
    pub tls: TlsOptions,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl NatsConn {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            user_credentials: None,
            tls: TlsOptions::default(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatsStreamingConn {
    #[serde(flatten)]
    pub nats: NatsConn,
    pub cluster_id: String,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatsJetstreamConn {
    #[serde(flatten)]
    pub nats: NatsConn,
}

/// Options for a single read call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadOptions {
    /// Keep reading until cancelled instead of stopping after one record
    #[serde(default)]
    pub continuous: bool,
    pub mqtt: Option<BackendGroup<MqttReadArgs>>,
    pub nats: Option<BackendGroup<NatsReadArgs>>,
    pub nats_streaming: Option<BackendGroup<NatsStreamingReadArgs>>,
    pub nats_jetstream: Option<BackendGroup<NatsJetstreamReadArgs>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MqttReadArgs {
    pub topic: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NatsReadArgs {
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatsStreamingReadArgs {
    pub channel: String,
    pub durable_name: Option<String>,
    /// Start with the last stored message
    #[serde(default)]
    pub read_last: bool,
    /// Replay every stored message
    #[serde(default)]
    pub read_all: bool,
    /// Start at a specific sequence number
    pub read_sequence_number: Option<u64>,
    /// Start with messages stored within the last N seconds
    pub read_since_secs: Option<u64>,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: i32,
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: i32,
}

impl NatsStreamingReadArgs {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            durable_name: None,
            read_last: false,
            read_all: false,
            read_sequence_number: None,
            read_since_secs: None,
            max_in_flight: DEFAULT_STAN_MAX_IN_FLIGHT,
            ack_wait_secs: DEFAULT_STAN_ACK_WAIT_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NatsJetstreamReadArgs {
    pub stream: String,
    /// Durable consumer to bind or create; an ephemeral consumer is used when unset
    pub consumer_name: Option<String>,
    pub filter_subject: Option<String>,
    pub start_sequence: Option<u64>,
    /// Leave a durable consumer in place after the read finishes
    #[serde(default)]
    pub keep_consumer: bool,
}

/// Options for a write call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteOptions {
    pub mqtt: Option<BackendGroup<MqttWriteArgs>>,
    pub nats: Option<BackendGroup<NatsWriteArgs>>,
    pub nats_streaming: Option<BackendGroup<NatsStreamingWriteArgs>>,
    pub nats_jetstream: Option<BackendGroup<NatsJetstreamWriteArgs>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MqttWriteArgs {
    pub topic: String,
    #[serde(default)]
    pub retain: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NatsWriteArgs {
    pub subject: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NatsStreamingWriteArgs {
    pub channel: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NatsJetstreamWriteArgs {
    pub subject: String,
}

/// Options for a tunnel call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelOptions {
    pub mqtt: Option<BackendGroup<MqttTunnelArgs>>,
    pub nats: Option<BackendGroup<NatsTunnelArgs>>,
    pub nats_streaming: Option<BackendGroup<NatsStreamingTunnelArgs>>,
    pub nats_jetstream: Option<BackendGroup<NatsJetstreamTunnelArgs>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MqttTunnelArgs {
    pub topic: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NatsTunnelArgs {
    pub subject: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NatsStreamingTunnelArgs {
    pub channel: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NatsJetstreamTunnelArgs {
    pub subject: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_options_deserialize() {
        let options: ConnectionOptions = parse(
            r#"{
                "name": "local-stan",
                "conn": {
                    "kind": "nats-streaming",
                    "dsn": "nats://localhost:4222",
                    "user_credentials": {"file": "/etc/nats/user.creds"},
                    "cluster_id": "test-cluster",
                    "client_id": "conduit"
                }
            }"#,
        );

        let stan = options.nats_streaming().unwrap();
        assert_eq!(stan.nats.dsn, "nats://localhost:4222");
        assert_eq!(stan.nats.connect_timeout_secs, DEFAULT_CONNECT_TIMEOUT_SECS);
        assert_eq!(stan.cluster_id, "test-cluster");
        assert!(options.nats().is_none());
        assert_eq!(options.conn.as_ref().unwrap().backend(), "nats-streaming");
    }

    #[test]
    fn test_read_options_defaults() {
        let options: ReadOptions =
            parse(r#"{"mqtt": {"args": {"topic": "sensors/#"}}}"#);

        assert!(!options.continuous);
        assert_eq!(
            options.mqtt.unwrap().args.unwrap().topic,
            "sensors/#".to_string()
        );
        assert!(options.nats.is_none());
    }

    #[test]
    fn test_streaming_read_args_defaults() {
        let args: NatsStreamingReadArgs = parse(r#"{"channel": "orders"}"#);
        assert_eq!(args.max_in_flight, DEFAULT_STAN_MAX_IN_FLIGHT);
        assert_eq!(args.ack_wait_secs, DEFAULT_STAN_ACK_WAIT_SECS);
        assert!(!args.read_all);
    }

    fn parse<T: serde::de::DeserializeOwned>(json: &str) -> T {
        serde_json::from_str(json).unwrap()
    }
}
