//! Explicit sources for credentials and PEM material
//!
//! Connection settings never guess whether a value is a path or literal
//! content. The caller picks one, and the value is resolved once when the
//! backend connects.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaterialError {
    #[error("unable to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("material from {origin} is empty")]
    Empty { origin: String },
}

/// Where a piece of secret or certificate material comes from
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Material {
    /// Read from a file at connect time
    File(PathBuf),
    /// Literal content supplied with the settings
    Inline(String),
}

impl Material {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Material::File(path.into())
    }

    pub fn inline(content: impl Into<String>) -> Self {
        Material::Inline(content.into())
    }

    /// Path backing this material, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            Material::File(path) => Some(path),
            Material::Inline(_) => None,
        }
    }

    /// Resolve to text content
    pub fn load(&self) -> Result<String, MaterialError> {
        let content = match self {
            Material::File(path) => {
                std::fs::read_to_string(path).map_err(|source| MaterialError::Read {
                    path: path.clone(),
                    source,
                })?
            }
            Material::Inline(content) => content.clone(),
        };

        if content.trim().is_empty() {
            return Err(MaterialError::Empty {
                origin: self.origin(),
            });
        }

        Ok(content)
    }

    /// Resolve to raw bytes
    pub fn load_bytes(&self) -> Result<Vec<u8>, MaterialError> {
        self.load().map(String::into_bytes)
    }

    fn origin(&self) -> String {
        match self {
            Material::File(path) => format!("file '{}'", path.display()),
            Material::Inline(_) => "inline value".to_string(),
        }
    }
}

// Inline material is usually a secret, keep it out of logs
impl fmt::Debug for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Material::File(path) => f.debug_tuple("File").field(path).finish(),
            Material::Inline(_) => f.write_str("Inline(<redacted>)"),
        }
    }
}
