//! Operation options built from a single `--target` name
//!
//! The target means the topic, subject, channel or stream depending on which
//! broker the connection points at. Anything beyond that needs an options
//! file.

use relay_types::{
    BackendGroup, ConnectionArgs, MqttReadArgs, MqttTunnelArgs, MqttWriteArgs,
    NatsJetstreamReadArgs, NatsJetstreamTunnelArgs, NatsJetstreamWriteArgs, NatsReadArgs,
    NatsStreamingReadArgs, NatsStreamingTunnelArgs, NatsStreamingWriteArgs, NatsTunnelArgs,
    NatsWriteArgs, ReadOptions, TunnelOptions, WriteOptions,
};

pub fn read_options(conn: &ConnectionArgs, target: &str, continuous: bool) -> ReadOptions {
    let mut options = ReadOptions {
        continuous,
        ..ReadOptions::default()
    };

    match conn {
        ConnectionArgs::Mqtt(_) => {
            options.mqtt = Some(BackendGroup::new(MqttReadArgs {
                topic: target.to_string(),
            }));
        }
        ConnectionArgs::Nats(_) => {
            options.nats = Some(BackendGroup::new(NatsReadArgs {
                subject: target.to_string(),
            }));
        }
        ConnectionArgs::NatsStreaming(_) => {
            options.nats_streaming = Some(BackendGroup::new(NatsStreamingReadArgs::new(target)));
        }
        ConnectionArgs::NatsJetstream(_) => {
            options.nats_jetstream = Some(BackendGroup::new(NatsJetstreamReadArgs {
                stream: target.to_string(),
                ..NatsJetstreamReadArgs::default()
            }));
        }
    }

    options
}

pub fn write_options(conn: &ConnectionArgs, target: &str, retain: bool) -> WriteOptions {
    let mut options = WriteOptions::default();

    match conn {
        ConnectionArgs::Mqtt(_) => {
            options.mqtt = Some(BackendGroup::new(MqttWriteArgs {
                topic: target.to_string(),
                retain,
            }));
        }
        ConnectionArgs::Nats(_) => {
            options.nats = Some(BackendGroup::new(NatsWriteArgs {
                subject: target.to_string(),
            }));
        }
        ConnectionArgs::NatsStreaming(_) => {
            options.nats_streaming = Some(BackendGroup::new(NatsStreamingWriteArgs {
                channel: target.to_string(),
            }));
        }
        ConnectionArgs::NatsJetstream(_) => {
            options.nats_jetstream = Some(BackendGroup::new(NatsJetstreamWriteArgs {
                subject: target.to_string(),
            }));
        }
    }

    options
}

pub fn tunnel_options(conn: &ConnectionArgs, target: &str) -> TunnelOptions {
    let mut options = TunnelOptions::default();

    match conn {
        ConnectionArgs::Mqtt(_) => {
            options.mqtt = Some(BackendGroup::new(MqttTunnelArgs {
                topic: target.to_string(),
            }));
        }
        ConnectionArgs::Nats(_) => {
            options.nats = Some(BackendGroup::new(NatsTunnelArgs {
                subject: target.to_string(),
            }));
        }
        ConnectionArgs::NatsStreaming(_) => {
            options.nats_streaming = Some(BackendGroup::new(NatsStreamingTunnelArgs {
                channel: target.to_string(),
            }));
        }
        ConnectionArgs::NatsJetstream(_) => {
            options.nats_jetstream = Some(BackendGroup::new(NatsJetstreamTunnelArgs {
                subject: target.to_string(),
            }));
        }
    }

    options
}
