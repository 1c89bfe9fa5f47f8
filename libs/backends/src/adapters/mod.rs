//! One adapter per broker

pub mod mqtt;
pub mod nats;
mod nats_conn;
pub mod nats_jetstream;
pub mod nats_streaming;

pub use mqtt::Mqtt;
pub use nats::Nats;
pub use nats_jetstream::NatsJetstream;
pub use nats_streaming::NatsStreaming;
