//! Runtime configuration: defaults, an optional TOML file, then environment.
use crate::error::{ArchiveError, Result};
use crate::ledger::DEFAULT_LOCK_STRIPES;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_DB_PATH: &str = "MAP_ARCHIVE_DB_PATH";
pub const ENV_LOCK_STRIPES: &str = "MAP_ARCHIVE_LOCK_STRIPES";
pub const ENV_LOG: &str = "MAP_ARCHIVE_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveConfig {
    pub db_path: PathBuf,
    /// Background flush interval handed to sled; `None` flushes only on demand.
    pub flush_every_ms: Option<u64>,
    pub lock_stripes: usize,
    pub log_filter: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("map-archive.db"),
            flush_every_ms: Some(500),
            lock_stripes: DEFAULT_LOCK_STRIPES,
            log_filter: "info".to_string(),
        }
    }
}

impl ArchiveConfig {
    /// Defaults, overlaid by `path` when given, overlaid by the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ArchiveError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&contents)
            .map_err(|e| ArchiveError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| ArchiveError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `MAP_ARCHIVE_*` variables as returned by `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DB_PATH) {
            self.db_path = PathBuf::from(path);
        }
        if let Some(stripes) = lookup(ENV_LOCK_STRIPES) {
            self.lock_stripes = stripes.trim().parse().map_err(|e| {
                ArchiveError::Config(format!("{ENV_LOCK_STRIPES}={stripes:?} is not a count: {e}"))
            })?;
        }
        if let Some(filter) = lookup(ENV_LOG) {
            self.log_filter = filter;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_stripes == 0 {
            return Err(ArchiveError::Config("lock_stripes must be at least 1".into()));
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(ArchiveError::Config("db_path must not be empty".into()));
        }
        Ok(())
    }

    pub fn open_db(&self) -> Result<sled::Db> {
        tracing::debug!(path = %self.db_path.display(), "opening database");
        let db = sled::Config::new()
            .path(&self.db_path)
            .flush_every_ms(self.flush_every_ms)
            .open()?;
        Ok(db)
    }
}
