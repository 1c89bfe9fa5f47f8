//! Uniform read, write and tunnel access to message brokers
//!
//! Every broker is exposed through the [`Backend`] trait. Reads normalize
//! broker deliveries into [`ReadRecord`]s through a [`Relay`], tunnels replay
//! records from a [`TunnelService`], and every resource an adapter opens is
//! released by [`Backend::close`].

pub mod adapters;
pub mod error;
pub mod factory;
pub mod lifecycle;
pub mod publish;
pub mod relay;
pub mod test_utils;
pub mod tls;
pub mod tunnel;
pub mod validate;

use async_trait::async_trait;
use relay_types::{ErrorRecord, ReadOptions, ReadRecord, TunnelOptions, WriteOptions, WriteRecord};
use std::fmt::Debug;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use adapters::{Mqtt, Nats, NatsJetstream, NatsStreaming};
pub use error::{BackendError, ConnectStep, Operation};
pub use factory::connect;
pub use lifecycle::{Handle, HandleStack, TaskHandle};
pub use publish::Publisher;
pub use relay::{Delivery, Envelope, Relay, SerializeFailure};
pub use tunnel::{ChannelTunnel, TunnelService};

/// A connected broker
///
/// Operations take `&mut self`, so one instance never runs two reads, a read
/// and a tunnel, or a read and a close at the same time.
#[async_trait]
pub trait Backend: Send + Debug {
    /// Stable backend identifier such as `"mqtt"` or `"nats-jetstream"`
    fn name(&self) -> &'static str;

    /// Liveness check; [`BackendError::NotImplemented`] when the broker has none
    async fn test(&mut self, ctx: &CancellationToken) -> Result<(), BackendError>;

    /// Release every handle; closing twice is a no-op
    async fn close(&mut self, ctx: &CancellationToken) -> Result<(), BackendError>;

    /// Stream normalized records into `results` until one record has been
    /// emitted, or until `ctx` is cancelled when reading continuously
    async fn read(
        &mut self,
        ctx: &CancellationToken,
        options: &ReadOptions,
        results: mpsc::Sender<ReadRecord>,
        errors: mpsc::Sender<ErrorRecord>,
    ) -> Result<(), BackendError>;

    /// Publish `records` in order, reporting per-record failures on `errors`
    async fn write(
        &mut self,
        ctx: &CancellationToken,
        options: &WriteOptions,
        errors: mpsc::Sender<ErrorRecord>,
        records: Vec<WriteRecord>,
    ) -> Result<(), BackendError>;

    /// Replay records from `tunnel` until `ctx` is cancelled
    async fn tunnel(
        &mut self,
        ctx: &CancellationToken,
        options: &TunnelOptions,
        tunnel: &mut dyn TunnelService,
        errors: mpsc::Sender<ErrorRecord>,
    ) -> Result<(), BackendError>;
}
