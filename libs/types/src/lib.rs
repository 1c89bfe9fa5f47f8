//! # Relay Types
//!
//! Shared data shapes for the relay backends:
//!
//! - **Records**: [`ReadRecord`], [`ErrorRecord`], [`TunnelOutboundRecord`], [`WriteRecord`]
//! - **Options**: connection, read, write and tunnel configuration trees
//! - **Material**: explicit file-or-inline sources for credentials and certificates
//! - **Errors**: structural [`ValidationError`]s
//!
//! No backend or runtime code lives here; every adapter depends on these types
//! so records look the same regardless of the broker they came from.

pub mod errors;
pub mod material;
pub mod options;
pub mod records;

pub use errors::ValidationError;
pub use material::{Material, MaterialError};
pub use options::*;
pub use records::{
    unix_ts_utc, BackendRecord, ErrorRecord, MqttRecord, NatsJetstreamRecord, NatsRecord,
    NatsStreamingRecord, ReadRecord, TunnelOutboundRecord, WriteRecord,
};
