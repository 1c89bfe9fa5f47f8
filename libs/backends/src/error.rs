use relay_types::ValidationError;
use std::fmt;

/// Operation whose options failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Read,
    Write,
    Tunnel,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Operation::Connect => "connection",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Tunnel => "tunnel",
        };
        f.write_str(label)
    }
}

/// Stage of connection setup that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStep {
    ParseAddress,
    Credentials,
    Tls,
    Transport,
    Session,
}

impl fmt::Display for ConnectStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectStep::ParseAddress => "address parsing",
            ConnectStep::Credentials => "credential loading",
            ConnectStep::Tls => "TLS setup",
            ConnectStep::Transport => "transport connect",
            ConnectStep::Session => "session handshake",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("unable to validate {op} options: {source}")]
    Validation {
        op: Operation,
        #[source]
        source: ValidationError,
    },

    #[error("{step} failed: {message}")]
    Connect { step: ConnectStep, message: String },

    #[error("unable to subscribe to '{target}': {message}")]
    Subscribe { target: String, message: String },

    #[error("unable to publish to '{target}': {message}")]
    Publish { target: String, message: String },

    #[error("read aborted: {0}")]
    Read(String),

    #[error("unable to create tunnel: {0}")]
    Tunnel(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("health check failed: {0}")]
    HealthCheck(String),

    #[error("unable to close {handle}: {message}")]
    Close {
        handle: &'static str,
        message: String,
    },

    #[error("not implemented")]
    NotImplemented,

    #[error("backend is closed")]
    Closed,
}

impl BackendError {
    /// Check if the caller supplied incomplete options
    pub fn is_validation(&self) -> bool {
        matches!(self, BackendError::Validation { .. })
    }

    /// Validation failure carried by this error, if any
    pub fn validation_error(&self) -> Option<&ValidationError> {
        match self {
            BackendError::Validation { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Check if this is a connection-related error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, BackendError::Connect { .. } | BackendError::Closed)
    }

    pub fn validation(op: Operation, source: ValidationError) -> Self {
        BackendError::Validation { op, source }
    }

    pub fn connect(step: ConnectStep, message: impl fmt::Display) -> Self {
        BackendError::Connect {
            step,
            message: message.to_string(),
        }
    }

    pub fn subscribe(target: impl Into<String>, message: impl fmt::Display) -> Self {
        BackendError::Subscribe {
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn publish(target: impl Into<String>, message: impl fmt::Display) -> Self {
        BackendError::Publish {
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn read(message: impl fmt::Display) -> Self {
        BackendError::Read(message.to_string())
    }

    pub fn session(message: impl fmt::Display) -> Self {
        BackendError::Session(message.to_string())
    }

    pub fn close(handle: &'static str, message: impl fmt::Display) -> Self {
        BackendError::Close {
            handle,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_names_operation() {
        let err = BackendError::validation(Operation::Read, ValidationError::EmptyTopic);
        assert_eq!(
            err.to_string(),
            "unable to validate read options: topic cannot be empty"
        );
        assert!(err.is_validation());
        assert_eq!(err.validation_error(), Some(&ValidationError::EmptyTopic));
    }

    #[test]
    fn test_connect_error_names_step() {
        let err = BackendError::connect(ConnectStep::Credentials, "file not found");
        assert_eq!(err.to_string(), "credential loading failed: file not found");
        assert!(err.is_connection_error());
        assert!(!err.is_validation());
    }
}
