//! Option documents supplied by file
//!
//! Connection, read, write and tunnel options can be kept in TOML or JSON
//! files. The format follows the file extension, defaulting to TOML.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

/// Parse a TOML or JSON document into `T`
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse JSON document {}", path.display()))
    } else {
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML document {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::{ConnectionArgs, ConnectionOptions, Material, ReadOptions};
    use tempfile::tempdir;

    #[test]
    fn test_toml_connection() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stan.toml");
        fs::write(
            &path,
            r#"
name = "local-stan"

[conn]
kind = "nats-streaming"
dsn = "nats://localhost:4222"
cluster_id = "test-cluster"
client_id = "conduit-1"
user_credentials = { file = "/etc/nats/user.creds" }
"#,
        )
        .unwrap();

        let options: ConnectionOptions = load_document(&path).unwrap();
        match options.conn {
            Some(ConnectionArgs::NatsStreaming(conn)) => {
                assert_eq!(conn.cluster_id, "test-cluster");
                assert_eq!(conn.nats.dsn, "nats://localhost:4222");
                assert_eq!(
                    conn.nats.user_credentials,
                    Some(Material::file("/etc/nats/user.creds"))
                );
            }
            other => panic!("unexpected conn {:?}", other),
        }
    }

    #[test]
    fn test_json_read_options() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("read.json");
        fs::write(
            &path,
            r#"{"continuous": true, "nats": {"args": {"subject": "orders.>"}}}"#,
        )
        .unwrap();

        let options: ReadOptions = load_document(&path).unwrap();
        assert!(options.continuous);
        let subject = options.nats.and_then(|group| group.args).map(|args| args.subject);
        assert_eq!(subject.as_deref(), Some("orders.>"));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "name = ").unwrap();

        let err = load_document::<ConnectionOptions>(&path).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }
}
