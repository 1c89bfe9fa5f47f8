//! Runtime settings for the relay CLI
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `CONDUIT_*` environment variables.

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "CONDUIT";

/// Settings file looked up in the working directory when none is given
pub const DEFAULT_SETTINGS_FILE: &str = "conduit.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Default tracing filter, overridden by `RUST_LOG`
    pub log_level: String,

    /// Emit logs as JSON lines
    pub log_json: bool,

    /// Capacity of the result and error channels handed to backends
    pub channel_capacity: usize,

    /// Upper bound on a backend connect, in seconds
    pub connect_timeout_secs: u64,

    /// Directory of the connection store, `~` is expanded
    pub store_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            channel_capacity: 1024,
            connect_timeout_secs: relay_types::DEFAULT_CONNECT_TIMEOUT_SECS,
            store_dir: format!("~/{}", crate::store::CONFIG_DIR_NAME),
        }
    }
}

impl Settings {
    /// Load settings with `CONDUIT_*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Load settings, reading overrides from `<prefix>_*` variables
    pub fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();

        builder = match path {
            Some(path) => {
                debug!(path = %path.display(), "Loading settings file");
                builder.add_source(File::from(path).required(true))
            }
            None => builder.add_source(File::with_name(DEFAULT_SETTINGS_FILE).required(false)),
        };

        builder = builder.add_source(Environment::with_prefix(prefix).try_parsing(true));

        let settings: Settings = builder
            .build()
            .context("Failed to build settings")?
            .try_deserialize()
            .context("Failed to deserialize settings")?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            bail!("channel_capacity must be greater than zero");
        }
        if self.connect_timeout_secs == 0 {
            bail!("connect_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    /// Store directory with `~` and environment variables expanded
    pub fn store_dir(&self) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.store_dir)
            .with_context(|| format!("Failed to expand store_dir '{}'", self.store_dir))?;
        Ok(PathBuf::from(expanded.as_ref()))
    }

    /// Render as a TOML document
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render settings")
    }
}
