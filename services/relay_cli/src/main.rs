//! Conduit command line
//!
//! Usage:
//!   conduit connections add local --file local-nats.toml
//!   conduit read --connection local --target 'orders.>' --continuous
//!   echo '{"id": 1}' | conduit write --connection local --target orders.new
//!   conduit tunnel --connection-file replay.toml --options tunnel.toml

mod commands;
mod target;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use commands::{App, ConnectionSource, OptionsSource};
use relay_config::{ConfigStore, Settings};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(about = "Read, write and replay messages across MQTT and NATS brokers")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to ./conduit.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter such as `debug` or `relay_backends=trace`; RUST_LOG wins when set
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Directory of the connection store
    #[arg(long, global = true)]
    store_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct ConnectionArg {
    /// Name of a stored connection
    #[arg(long)]
    connection: Option<String>,

    /// TOML or JSON file holding connection options
    #[arg(long)]
    connection_file: Option<PathBuf>,
}

impl ConnectionArg {
    fn source(&self) -> Result<ConnectionSource> {
        match (&self.connection, &self.connection_file) {
            (Some(name), _) => Ok(ConnectionSource::Stored(name.clone())),
            (None, Some(path)) => Ok(ConnectionSource::File(path.clone())),
            (None, None) => Err(anyhow!("A connection is required")),
        }
    }
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct OptionsArg {
    /// Topic, subject, channel or stream, depending on the broker
    #[arg(short, long)]
    target: Option<String>,

    /// TOML or JSON file holding the full operation options
    #[arg(long)]
    options: Option<PathBuf>,
}

impl OptionsArg {
    fn source(&self) -> Result<OptionsSource> {
        match (&self.target, &self.options) {
            (Some(name), _) => Ok(OptionsSource::Target(name.clone())),
            (None, Some(path)) => Ok(OptionsSource::File(path.clone())),
            (None, None) => Err(anyhow!("Either --target or --options is required")),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read messages and print them as JSON lines
    Read {
        #[command(flatten)]
        connection: ConnectionArg,
        #[command(flatten)]
        options: OptionsArg,
        /// Keep reading until interrupted
        #[arg(long)]
        continuous: bool,
    },
    /// Publish records given as arguments, or one per stdin line
    Write {
        #[command(flatten)]
        connection: ConnectionArg,
        #[command(flatten)]
        options: OptionsArg,
        /// Record payload, may be repeated
        #[arg(short, long = "record")]
        records: Vec<String>,
        /// Header applied to every record as KEY=VALUE, may be repeated
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
        /// Set the MQTT retain flag
        #[arg(long)]
        retain: bool,
    },
    /// Check that a connection is usable
    Test {
        #[command(flatten)]
        connection: ConnectionArg,
    },
    /// Replay stdin lines to the broker until interrupted
    Tunnel {
        #[command(flatten)]
        connection: ConnectionArg,
        #[command(flatten)]
        options: OptionsArg,
    },
    /// Manage stored connections
    #[command(subcommand)]
    Connections(ConnectionCommands),
    /// Print the resolved settings
    Settings,
}

#[derive(Subcommand, Debug)]
enum ConnectionCommands {
    /// List stored connections
    List,
    /// Store a connection read from a TOML or JSON file
    Add {
        name: String,
        #[arg(short, long)]
        file: PathBuf,
        /// Overwrite an existing connection with the same name
        #[arg(long)]
        replace: bool,
    },
    /// Delete a stored connection
    Remove { name: String },
    /// Print a stored connection as JSON
    Show { name: String },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    // stdout carries records, logs go to stderr
    if json {
        builder.json().try_init().map_err(|e| anyhow!(e))
    } else {
        builder.try_init().map_err(|e| anyhow!(e))
    }
}

/// Cancel `shutdown` on Ctrl-C
fn watch_signals(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        settings.log_level = level.clone();
    }
    if let Some(dir) = &cli.store_dir {
        settings.store_dir = dir.clone();
    }
    settings.log_json |= cli.json_logs;

    init_logging(&settings.log_level, settings.log_json)?;

    let store = ConfigStore::new(settings.store_dir()?);
    let shutdown = CancellationToken::new();
    watch_signals(shutdown.clone());

    let app = App {
        settings,
        store,
        shutdown,
    };

    match cli.command {
        Commands::Read {
            connection,
            options,
            continuous,
        } => commands::read(&app, &connection.source()?, &options.source()?, continuous).await,
        Commands::Write {
            connection,
            options,
            records,
            headers,
            retain,
        } => {
            commands::write(
                &app,
                &connection.source()?,
                &options.source()?,
                retain,
                &records,
                &headers,
            )
            .await
        }
        Commands::Test { connection } => commands::test(&app, &connection.source()?).await,
        Commands::Tunnel {
            connection,
            options,
        } => commands::tunnel(&app, &connection.source()?, &options.source()?).await,
        Commands::Connections(command) => match command {
            ConnectionCommands::List => commands::list_connections(&app.store),
            ConnectionCommands::Add {
                name,
                file,
                replace,
            } => commands::add_connection(&app.store, &name, &file, replace),
            ConnectionCommands::Remove { name } => commands::remove_connection(&app.store, &name),
            ConnectionCommands::Show { name } => commands::show_connection(&app.store, &name),
        },
        Commands::Settings => {
            print!("{}", app.settings.to_toml()?);
            Ok(())
        }
    }
}
