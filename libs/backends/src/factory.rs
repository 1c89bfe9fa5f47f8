//! Backend construction from connection options
//!
//! [`connect`] is the single entry point callers use. It dispatches on the
//! configured connection kind, so supporting a new broker means adding one
//! arm here and one adapter module.

use crate::adapters::{Mqtt, Nats, NatsJetstream, NatsStreaming};
use crate::error::{BackendError, Operation};
use crate::Backend;
use relay_types::{ConnectionArgs, ConnectionOptions, ValidationError};

/// Connect to the broker described by `options`
pub async fn connect(options: &ConnectionOptions) -> Result<Box<dyn Backend>, BackendError> {
    let conn = options.conn.as_ref().ok_or_else(|| {
        BackendError::validation(Operation::Connect, ValidationError::MissingConnCfg)
    })?;

    tracing::debug!(
        connection = %options.name,
        backend = conn.backend(),
        "Creating backend"
    );

    let backend: Box<dyn Backend> = match conn {
        ConnectionArgs::Mqtt(_) => Box::new(Mqtt::new(options).await?),
        ConnectionArgs::Nats(_) => Box::new(Nats::new(options).await?),
        ConnectionArgs::NatsStreaming(_) => Box::new(NatsStreaming::new(options).await?),
        ConnectionArgs::NatsJetstream(_) => Box::new(NatsJetstream::new(options).await?),
    };

    tracing::info!(
        connection = %options.name,
        backend = backend.name(),
        "Created backend"
    );
    Ok(backend)
}
