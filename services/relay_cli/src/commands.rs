//! Subcommand implementations

use crate::target;
use anyhow::{anyhow, bail, Context, Result};
use relay_backends::{Backend, ChannelTunnel};
use relay_config::{load_document, ConfigStore, Settings, CONFIG_FILE};
use relay_types::{
    ConnectionOptions, ErrorRecord, ReadOptions, ReadRecord, TunnelOptions, TunnelOutboundRecord,
    WriteOptions, WriteRecord,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Where the connection for an operation comes from
pub enum ConnectionSource {
    Stored(String),
    File(PathBuf),
}

/// Where the operation's options come from
pub enum OptionsSource {
    Target(String),
    File(PathBuf),
}

/// Shared state for every subcommand
pub struct App {
    pub settings: Settings,
    pub store: ConfigStore,
    pub shutdown: CancellationToken,
}

impl App {
    fn resolve(&self, source: &ConnectionSource) -> Result<ConnectionOptions> {
        match source {
            ConnectionSource::File(path) => load_document(path),
            ConnectionSource::Stored(name) => {
                let stored = self.store.read(CONFIG_FILE)?;
                stored
                    .connections
                    .get(name)
                    .cloned()
                    .ok_or_else(|| anyhow!("No stored connection named '{}'", name))
            }
        }
    }

    async fn connect(&self, options: &ConnectionOptions) -> Result<Box<dyn Backend>> {
        let timeout = Duration::from_secs(self.settings.connect_timeout_secs);
        let backend = tokio::time::timeout(timeout, relay_backends::connect(options))
            .await
            .map_err(|_| anyhow!("Timed out connecting to '{}' after {:?}", options.name, timeout))?
            .with_context(|| format!("Failed to connect to '{}'", options.name))?;
        Ok(backend)
    }

    fn channels<T>(&self) -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
        mpsc::channel(self.settings.channel_capacity)
    }
}

fn conn_args(options: &ConnectionOptions) -> Result<&relay_types::ConnectionArgs> {
    options
        .conn
        .as_ref()
        .ok_or_else(|| anyhow!("Connection '{}' has no broker settings", options.name))
}

/// Log every error record until the channel closes
fn drain_errors(mut errors: mpsc::Receiver<ErrorRecord>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut count = 0;
        while let Some(record) = errors.recv().await {
            count += 1;
            warn!(error = %record.error, metadata = ?record.metadata, "Backend reported an error");
        }
        count
    })
}

/// JSON line shown for each record read
pub fn render_record(record: &ReadRecord) -> serde_json::Value {
    json!({
        "num": record.num,
        "message_id": record.message_id,
        "backend": record.backend(),
        "received_at_unix_ts_utc": record.received_at_unix_ts_utc,
        "payload": String::from_utf8_lossy(&record.payload),
        "record": record.record,
    })
}

async fn finish(app: &App, mut backend: Box<dyn Backend>, outcome: Result<()>) -> Result<()> {
    let closed = backend
        .close(&app.shutdown)
        .await
        .context("Failed to close backend");
    outcome.and(closed)
}

pub async fn read(
    app: &App,
    connection: &ConnectionSource,
    options: &OptionsSource,
    continuous: bool,
) -> Result<()> {
    let conn = app.resolve(connection)?;
    let mut read_options: ReadOptions = match options {
        OptionsSource::Target(name) => target::read_options(conn_args(&conn)?, name, continuous),
        OptionsSource::File(path) => load_document(path)?,
    };
    read_options.continuous |= continuous;

    let mut backend = app.connect(&conn).await?;
    let (results_tx, mut results_rx) = app.channels::<ReadRecord>();
    let (errors_tx, errors_rx) = app.channels::<ErrorRecord>();

    let printer = tokio::spawn(async move {
        while let Some(record) = results_rx.recv().await {
            println!("{}", render_record(&record));
        }
    });
    let errors = drain_errors(errors_rx);

    let outcome = backend
        .read(&app.shutdown, &read_options, results_tx, errors_tx)
        .await
        .context("Read failed");

    let outcome = finish(app, backend, outcome).await;
    printer.await.context("Record printer panicked")?;
    errors.await.context("Error logger panicked")?;
    outcome
}

/// Records from `--record` values, or one per stdin line when none are given
async fn write_records(values: &[String], headers: &[(String, String)]) -> Result<Vec<WriteRecord>> {
    let inputs = if values.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut inputs = Vec::new();
        while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
            inputs.push(line);
        }
        inputs
    } else {
        values.to_vec()
    };

    Ok(inputs
        .into_iter()
        .map(|input| {
            headers
                .iter()
                .fold(WriteRecord::new(input), |record, (key, value)| {
                    record.with_header(key.clone(), value.clone())
                })
        })
        .collect())
}

pub async fn write(
    app: &App,
    connection: &ConnectionSource,
    options: &OptionsSource,
    retain: bool,
    values: &[String],
    headers: &[(String, String)],
) -> Result<()> {
    let conn = app.resolve(connection)?;
    let write_options: WriteOptions = match options {
        OptionsSource::Target(name) => target::write_options(conn_args(&conn)?, name, retain),
        OptionsSource::File(path) => load_document(path)?,
    };

    let records = write_records(values, headers).await?;
    if records.is_empty() {
        bail!("Nothing to write");
    }
    let total = records.len();

    let mut backend = app.connect(&conn).await?;
    let (errors_tx, errors_rx) = app.channels::<ErrorRecord>();
    let errors = drain_errors(errors_rx);

    let outcome = backend
        .write(&app.shutdown, &write_options, errors_tx, records)
        .await
        .context("Write failed");

    let outcome = finish(app, backend, outcome).await;
    let failed = errors.await.context("Error logger panicked")?;
    outcome?;

    info!(written = total - failed.min(total), failed, "Write finished");
    Ok(())
}

pub async fn test(app: &App, connection: &ConnectionSource) -> Result<()> {
    let conn = app.resolve(connection)?;
    let mut backend = app.connect(&conn).await?;

    let outcome = backend
        .test(&app.shutdown)
        .await
        .with_context(|| format!("Connection test for '{}' failed", conn.name));
    if outcome.is_ok() {
        println!("{}: ok ({})", conn.name, backend.name());
    }

    finish(app, backend, outcome).await
}

/// Feed stdin lines into the tunnel, numbering them as replay ids
fn stdin_replay(records: mpsc::Sender<TunnelOutboundRecord>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut n: u64 = 0;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    n += 1;
                    let record = TunnelOutboundRecord::new(line, format!("stdin-{}", n));
                    if records.send(record).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!(replayed = n, "stdin closed, press Ctrl-C to stop");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
    })
}

pub async fn tunnel(
    app: &App,
    connection: &ConnectionSource,
    options: &OptionsSource,
) -> Result<()> {
    let conn = app.resolve(connection)?;
    let tunnel_options: TunnelOptions = match options {
        OptionsSource::Target(name) => target::tunnel_options(conn_args(&conn)?, name),
        OptionsSource::File(path) => load_document(path)?,
    };

    let mut backend = app.connect(&conn).await?;
    let (mut service, records) = ChannelTunnel::new(app.settings.channel_capacity);
    let feeder = stdin_replay(records);
    let (errors_tx, errors_rx) = app.channels::<ErrorRecord>();
    let errors = drain_errors(errors_rx);

    let outcome = backend
        .tunnel(&app.shutdown, &tunnel_options, &mut service, errors_tx)
        .await
        .context("Tunnel failed");

    // stdin reads block, so the feeder may never notice shutdown on its own
    feeder.abort();
    let outcome = finish(app, backend, outcome).await;
    errors.await.context("Error logger panicked")?;
    outcome
}

pub fn list_connections(store: &ConfigStore) -> Result<()> {
    let stored = store.read(CONFIG_FILE)?;
    for (name, conn) in &stored.connections {
        let kind = conn.conn.as_ref().map(|c| c.backend()).unwrap_or("unset");
        if conn.notes.is_empty() {
            println!("{}\t{}", name, kind);
        } else {
            println!("{}\t{}\t{}", name, kind, conn.notes);
        }
    }
    Ok(())
}

pub fn add_connection(store: &ConfigStore, name: &str, file: &Path, replace: bool) -> Result<()> {
    let mut options: ConnectionOptions = load_document(file)?;
    if options.conn.is_none() {
        bail!("{} has no [conn] section", file.display());
    }
    options.name = name.to_string();

    let mut stored = store.read(CONFIG_FILE)?;
    if stored.connections.contains_key(name) && !replace {
        bail!("Connection '{}' already exists, pass --replace to overwrite it", name);
    }
    stored.connections.insert(name.to_string(), options);
    stored.save(store)?;

    info!(name, "Saved connection");
    Ok(())
}

pub fn remove_connection(store: &ConfigStore, name: &str) -> Result<()> {
    let mut stored = store.read(CONFIG_FILE)?;
    if stored.connections.remove(name).is_none() {
        bail!("No stored connection named '{}'", name);
    }
    stored.save(store)?;

    info!(name, "Removed connection");
    Ok(())
}

pub fn show_connection(store: &ConfigStore, name: &str) -> Result<()> {
    let stored = store.read(CONFIG_FILE)?;
    let conn = stored
        .connections
        .get(name)
        .ok_or_else(|| anyhow!("No stored connection named '{}'", name))?;
    println!("{}", serde_json::to_string_pretty(conn)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::{BackendRecord, NatsRecord};
    use std::collections::BTreeMap;

    #[test]
    fn test_render_record_shows_text_payload() {
        let record = ReadRecord::new(
            3,
            1_700_000_000,
            b"hello".to_vec(),
            None,
            BackendRecord::Nats(NatsRecord {
                subject: "greetings".to_string(),
                value: b"hello".to_vec(),
                headers: BTreeMap::new(),
            }),
        );

        let line = render_record(&record);
        assert_eq!(line["num"], 3);
        assert_eq!(line["backend"], "nats");
        assert_eq!(line["payload"], "hello");
        assert_eq!(line["record"]["subject"], "greetings");
    }

    #[tokio::test]
    async fn test_write_records_apply_headers() {
        let headers = vec![("source".to_string(), "cli".to_string())];
        let records = write_records(&["a".to_string(), "b".to_string()], &headers)
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].input, b"b");
        assert_eq!(records[0].headers.get("source").map(String::as_str), Some("cli"));
    }

    #[test]
    fn test_stored_connection_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let file = dir.path().join("local.toml");
        std::fs::write(
            &file,
            "name = \"ignored\"\n[conn]\nkind = \"nats\"\ndsn = \"nats://localhost:4222\"\n",
        )
        .unwrap();

        add_connection(&store, "local", &file, false).unwrap();
        assert!(add_connection(&store, "local", &file, false).is_err());
        add_connection(&store, "local", &file, true).unwrap();

        let stored = store.read(CONFIG_FILE).unwrap();
        assert_eq!(stored.connections["local"].name, "local");

        remove_connection(&store, "local").unwrap();
        assert!(remove_connection(&store, "local").is_err());
    }

    #[test]
    fn test_resolve_unknown_connection() {
        let dir = tempfile::tempdir().unwrap();
        let app = App {
            settings: Settings::default(),
            store: ConfigStore::new(dir.path()),
            shutdown: CancellationToken::new(),
        };

        let err = app
            .resolve(&ConnectionSource::Stored("missing".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
