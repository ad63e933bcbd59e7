#[cfg(test)]
mod tests;

pub mod logging;

use serde::{Deserialize, Serialize};
use std::{fs, io, path::{Path, PathBuf}};
use thiserror::Error;

/// Canonical error type shared across catalog subsystems.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("catalog: {0}")]
    Catalog(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),
    #[error("namespace exists: {0}")]
    NamespaceExists(String),
    #[error("write conflict: {0}")]
    WriteConflict(String),
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Runtime configuration for the catalog components.
///
/// # Example
/// ```
/// use common::Config;
/// use std::path::PathBuf;
///
/// let config = Config::builder()
///     .data_dir(PathBuf::from("./my_db"))
///     .multitenancy_support(true)
///     .default_profile_level(1)
///     .build();
/// assert_eq!(config.log_filter, "info");
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Directory where the durable catalog is persisted.
    #[builder(default = PathBuf::from("./db_data"))]
    pub data_dir: PathBuf,
    /// When disabled every database is treated as belonging to no tenant.
    #[builder(default = false)]
    pub multitenancy_support: bool,
    /// Profiling level reported for databases without explicit settings.
    #[builder(default = 0)]
    pub default_profile_level: i32,
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    #[builder(default = String::from("info"))]
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./db_data"),
            multitenancy_support: false,
            default_profile_level: 0,
            log_filter: String::from("info"),
        }
    }
}

impl Config {
    /// Load a config file, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> DbResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|err| DbError::Config(format!("invalid config file: {err}")))
    }

    /// Persist the config as pretty JSON.
    pub fn save(&self, path: &Path) -> DbResult<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|err| DbError::Config(format!("serialize failed: {err}")))?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Location of the persisted durable catalog inside `data_dir`.
    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog.json")
    }
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{Config, DbError, DbResult};
    pub use types::{
        CatalogId, CollectionUuid, DatabaseName, NamespaceString, NamespaceStringOrUuid,
        TenantId, Timestamp,
    };
}
