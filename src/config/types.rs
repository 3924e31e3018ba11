//! Runtime configuration of the synchronizer.

use crate::dialect::DialectKind;
use crate::error::ConfigError;
use std::path::PathBuf;

/// Postgres schema holding the synchronized tables when none is configured.
pub const DEFAULT_SCHEMA: &str = "public";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    pub database_url: String,
    /// Derived from the URL scheme.
    pub dialect: DialectKind,
    /// Postgres only.
    pub schema: String,
    /// Root of the persisted documents: `entities/<Name>.json` and `history.json`.
    pub project_dir: PathBuf,
    pub max_connections: u32,
}

impl SyncConfig {
    pub fn new(database_url: impl Into<String>) -> Result<Self, ConfigError> {
        let database_url = database_url.into();
        let dialect = DialectKind::from_url(&database_url)?;
        Ok(SyncConfig {
            database_url,
            dialect,
            schema: DEFAULT_SCHEMA.to_string(),
            project_dir: PathBuf::from("."),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        })
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = dir.into();
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn entities_dir(&self) -> PathBuf {
        self.project_dir.join("entities")
    }

    pub fn history_path(&self) -> PathBuf {
        self.project_dir.join("history.json")
    }
}
