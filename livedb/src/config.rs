use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Options for opening a [`Database`](crate::Database).
///
/// Every field has a default, so a YAML file only needs the keys it changes:
///
/// ```yaml
/// path: data/cache.db
/// version: 3
/// log_queries: true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file. `None` keeps the database in a private temporary file
    /// that is deleted on close.
    pub path: Option<PathBuf>,
    /// Expected value of `PRAGMA user_version`.
    pub version: u32,
    /// The primary handle creates tables and may adopt an unset (zero) version.
    pub primary: bool,
    pub log_queries: bool,
    pub log_query_plans: bool,
    pub debounce_ms: u64,
    pub teardown_grace_ms: u64,
    pub statement_cache_capacity: usize,
    pub schema_retry_attempts: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            version: 1,
            primary: true,
            log_queries: false,
            log_query_plans: false,
            debounce_ms: 10,
            teardown_grace_ms: 10,
            statement_cache_capacity: 500,
            schema_retry_attempts: 3,
            busy_timeout_ms: 5000,
        }
    }
}

impl DatabaseConfig {
    /// Throwaway configuration with no path, mostly useful for tests.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// File-backed configuration with every other option at its default.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Parse a YAML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse a YAML config string.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: DatabaseConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    /// Namespace used to address change broadcasts for this database.
    pub fn namespace(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => ":memory:".to_string(),
        }
    }
}
