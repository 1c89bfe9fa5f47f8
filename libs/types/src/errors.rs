//! Structural validation failures
//!
//! Raised before any network activity when caller supplied options are
//! incomplete. Validation only checks presence and non-emptiness, never
//! whether a topic or stream exists on the broker.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Connection options carry no backend configuration at all
    #[error("connection config cannot be empty")]
    MissingConnCfg,

    /// The options have no group for the backend being called
    #[error("backend group options cannot be empty")]
    EmptyBackendGroup,

    /// The backend group exists but has no arguments
    #[error("backend arg options cannot be empty")]
    EmptyBackendArgs,

    #[error("address cannot be empty")]
    EmptyAddress,

    #[error("topic cannot be empty")]
    EmptyTopic,

    #[error("subject cannot be empty")]
    MissingSubject,

    #[error("channel cannot be empty")]
    EmptyChannel,

    #[error("stream cannot be empty")]
    EmptyStream,

    #[error("cluster id cannot be empty")]
    EmptyClusterId,

    #[error("client id cannot be empty")]
    EmptyClientId,

    #[error("QoS level must be 0, 1 or 2 (got {0})")]
    InvalidQos(u8),

    #[error("you may only specify one read option of last, all, sequence, since")]
    InvalidReadOption,

    #[error("start sequence must be greater than zero")]
    InvalidStartSequence,

    #[error("connect timeout must be greater than zero")]
    InvalidConnectTimeout,

    #[error("TLS client certificate and key must be supplied together")]
    IncompleteClientCert,

    #[error("no records to write")]
    NoWriteRecords,
}
