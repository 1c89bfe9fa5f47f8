//! # Relay Config
//!
//! - **Settings**: layered runtime settings for the CLI ([`Settings`])
//! - **Store**: the persisted account and connection document ([`ConfigStore`])
//! - **Documents**: option trees loaded from TOML or JSON files

pub mod document;
pub mod settings;
pub mod store;

pub use document::load_document;
pub use settings::{Settings, DEFAULT_SETTINGS_FILE, ENV_PREFIX};
pub use store::{ConfigError, ConfigStore, StoredConfig, CONFIG_DIR_NAME, CONFIG_FILE};
