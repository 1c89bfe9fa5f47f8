//! Persisted account and connection store
//!
//! The store is a single JSON document under the user's config directory.
//! Connections are kept as opaque serialized strings keyed by name, so the
//! outer document stays readable even if a connection's shape changes.

use relay_types::ConnectionOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// File name of the main store document
pub const CONFIG_FILE: &str = "config.json";

/// Directory under the user's home holding the store
pub const CONFIG_DIR_NAME: &str = ".conduit";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to locate user's home directory")]
    NoHomeDir,

    #[error("unable to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not unmarshal {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unable to unmarshal stored connection '{name}': {source}")]
    Connection {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not marshal to JSON: {0}")]
    Marshal(#[from] serde_json::Error),
}

impl ConfigError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// In-memory form of the store document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredConfig {
    pub relay_id: String,
    pub token: String,
    pub team_id: String,
    pub user_id: String,
    pub connections: BTreeMap<String, ConnectionOptions>,
}

/// On-disk form; each connection is serialized on its own
#[derive(Debug, Default, Serialize, Deserialize)]
struct StorageConfig {
    #[serde(default)]
    relay_id: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    team_id: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    connections: BTreeMap<String, String>,
}

impl StoredConfig {
    /// Serialize to the on-disk JSON document
    pub fn marshal(&self) -> Result<Vec<u8>, ConfigError> {
        let mut connections = BTreeMap::new();
        for (name, conn) in &self.connections {
            connections.insert(name.clone(), serde_json::to_string(conn)?);
        }

        let storage = StorageConfig {
            relay_id: self.relay_id.clone(),
            token: self.token.clone(),
            team_id: self.team_id.clone(),
            user_id: self.user_id.clone(),
            connections,
        };
        Ok(serde_json::to_vec_pretty(&storage)?)
    }

    /// Persist to [`CONFIG_FILE`] in `store`
    pub fn save(&self, store: &ConfigStore) -> Result<(), ConfigError> {
        store.write(CONFIG_FILE, &self.marshal()?)
    }
}

/// Directory holding the store documents
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store at `~/.conduit`
    pub fn default_location() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(Self::new(home.join(CONFIG_DIR_NAME)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    pub fn exists(&self, file_name: &str) -> bool {
        self.path(file_name).exists()
    }

    /// Load a store document, creating an empty one on first use
    pub fn read(&self, file_name: &str) -> Result<StoredConfig, ConfigError> {
        let path = self.path(file_name);
        if !path.exists() {
            debug!(path = %path.display(), "Creating empty config");
            self.write(file_name, b"{}")?;
        }

        let data = fs::read(&path).map_err(|e| ConfigError::io(&path, e))?;
        let storage: StorageConfig =
            serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;

        let mut connections = BTreeMap::new();
        for (name, raw) in storage.connections {
            let conn = serde_json::from_str(&raw).map_err(|source| ConfigError::Connection {
                name: name.clone(),
                source,
            })?;
            connections.insert(name, conn);
        }

        info!(count = connections.len(), "Loaded stored connections");
        Ok(StoredConfig {
            relay_id: storage.relay_id,
            token: storage.token,
            team_id: storage.team_id,
            user_id: storage.user_id,
            connections,
        })
    }

    /// Replace a store document, readable only by the owner
    pub fn write(&self, file_name: &str, data: &[u8]) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.dir).map_err(|e| ConfigError::io(&self.dir, e))?;

        let path = self.path(file_name);
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&path).map_err(|e| ConfigError::io(&path, e))?;
        file.write_all(data).map_err(|e| ConfigError::io(&path, e))
    }
}
