//! Structural checks shared by every adapter
//!
//! Adapters compose these into their own per-operation validators. None of
//! them touch the network.

use relay_types::{BackendGroup, ConnectionOptions, TlsOptions, ValidationError};

/// Resolve a backend's connection args, distinguishing a missing config from
/// one that targets another backend
pub fn require_conn<'a, T, F>(
    options: &'a ConnectionOptions,
    select: F,
) -> Result<&'a T, ValidationError>
where
    F: FnOnce(&'a ConnectionOptions) -> Option<&'a T>,
{
    if options.conn.is_none() {
        return Err(ValidationError::MissingConnCfg);
    }
    select(options).ok_or(ValidationError::EmptyBackendArgs)
}

/// Resolve the args of a backend group within operation options
pub fn require_args<A>(group: Option<&BackendGroup<A>>) -> Result<&A, ValidationError> {
    let group = group.ok_or(ValidationError::EmptyBackendGroup)?;
    group.args.as_ref().ok_or(ValidationError::EmptyBackendArgs)
}

/// Reject empty or whitespace-only values
pub fn non_empty(value: &str, err: ValidationError) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(err);
    }
    Ok(())
}

/// A zero timeout would fail every connect attempt immediately
pub fn connect_timeout(secs: u64) -> Result<(), ValidationError> {
    if secs == 0 {
        return Err(ValidationError::InvalidConnectTimeout);
    }
    Ok(())
}

pub fn tls(options: &TlsOptions) -> Result<(), ValidationError> {
    if options.client_cert.is_some() != options.client_key.is_some() {
        return Err(ValidationError::IncompleteClientCert);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use relay_types::{ConnectionArgs, Material, MqttConn, MqttReadArgs, NatsConn};

    #[test]
    fn test_require_conn() {
        let mut options = ConnectionOptions::new(
            "local",
            ConnectionArgs::Nats(NatsConn::new("nats://localhost:4222")),
        );
        assert!(require_conn(&options, ConnectionOptions::nats).is_ok());
        assert_eq!(
            require_conn(&options, ConnectionOptions::mqtt).unwrap_err(),
            ValidationError::EmptyBackendArgs
        );

        options.conn = None;
        assert_eq!(
            require_conn(&options, ConnectionOptions::nats).unwrap_err(),
            ValidationError::MissingConnCfg
        );
    }

    #[test]
    fn test_require_args() {
        let missing: Option<&BackendGroup<MqttReadArgs>> = None;
        assert_eq!(require_args(missing).unwrap_err(), ValidationError::EmptyBackendGroup);

        let empty = BackendGroup::<MqttReadArgs>::empty();
        assert_eq!(require_args(Some(&empty)).unwrap_err(), ValidationError::EmptyBackendArgs);

        let group = BackendGroup::new(MqttReadArgs {
            topic: "a/b".to_string(),
        });
        assert_eq!(require_args(Some(&group)).unwrap().topic, "a/b");
    }

    #[test]
    fn test_connect_timeout() {
        assert_eq!(connect_timeout(0).unwrap_err(), ValidationError::InvalidConnectTimeout);
        assert!(connect_timeout(1).is_ok());
    }

    #[test]
    fn test_tls_requires_cert_and_key_together() {
        let mut conn = MqttConn::new("ssl://broker:8883");
        assert!(tls(&conn.tls).is_ok());

        conn.tls.client_cert = Some(Material::inline("cert"));
        assert_eq!(tls(&conn.tls).unwrap_err(), ValidationError::IncompleteClientCert);

        conn.tls.client_key = Some(Material::inline("key"));
        assert!(tls(&conn.tls).is_ok());
    }

    proptest! {
        #[test]
        fn prop_non_empty_accepts_any_visible_text(value in "[ \t]*[a-zA-Z0-9/#+>.*-]+[ \t]*") {
            prop_assert!(non_empty(&value, ValidationError::EmptyTopic).is_ok());
        }

        #[test]
        fn prop_non_empty_rejects_blank(value in "[ \t\r\n]*") {
            prop_assert_eq!(
                non_empty(&value, ValidationError::EmptyTopic),
                Err(ValidationError::EmptyTopic)
            );
        }
    }
}
