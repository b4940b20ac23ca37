use crate::error::CatalogError;
use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::Path,
};

pub const IN_MEMORY_DATABASE: &str = ":memory:";

/// Catalog settings, usually read from a `catalog.toml`.
///
/// ```toml
/// database = "data/catalog.db"
/// max_connections = 4
/// warn_shared_columns = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// SQLite file path, or `:memory:`.
    pub database: String,
    pub max_connections: u32,
    /// Log a warning when a construction graph exposes one attribute name on several types.
    pub warn_shared_columns: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            database: IN_MEMORY_DATABASE.to_string(),
            max_connections: 4,
            warn_shared_columns: true,
        }
    }
}

impl CatalogConfig {
    pub fn in_memory() -> Self {
        CatalogConfig::default()
    }

    pub fn sqlite<P: AsRef<Path>>(path: P) -> Self {
        CatalogConfig {
            database: path.as_ref().to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.database == IN_MEMORY_DATABASE
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CatalogError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        tracing::debug!("Reading catalog config from: {:?}", path.as_ref());
        let content = read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), CatalogError> {
        tracing::debug!("Writing catalog config to: {:?}", path.as_ref());
        write(path, toml::to_string(self)?)?;
        Ok(())
    }
}
