//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// SQLite event store settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Archive dump settings
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Object storage gateway settings
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration, or return defaults when the file does not exist.
    ///
    /// A file that exists but cannot be read or parsed is an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::warn!("No config file at {:?}. Using defaults.", path);
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("LINKSTATS_DATABASE") {
            self.database.path = PathBuf::from(path);
        }
        if let Ok(container) = std::env::var("ARCHIVE_CONTAINER_NAME") {
            self.archive.container = container;
        }
        if let Ok(backend) = std::env::var("OBJECT_STORAGE_BACKEND") {
            match backend.parse() {
                Ok(backend) => self.storage.backend = backend,
                Err(e) => log::warn!("Ignoring OBJECT_STORAGE_BACKEND: {}", e),
            }
        }
        if let Ok(root) = std::env::var("OBJECT_STORAGE_ROOT") {
            self.storage.local_root = PathBuf::from(root);
        }
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.as_os_str().is_empty() {
            return Err(AppError::validation("database.path is empty"));
        }
        if self.database.busy_timeout_ms == 0 {
            return Err(AppError::validation("database.busy_timeout_ms must be > 0"));
        }
        if self.logging.level.parse::<log::LevelFilter>().is_err() {
            return Err(AppError::validation(format!(
                "logging.level '{}' is not a log level",
                self.logging.level
            )));
        }
        if self.archive.chunk_size == 0 {
            return Err(AppError::validation("archive.chunk_size must be > 0"));
        }
        if self.archive.container.trim().is_empty() {
            return Err(AppError::validation("archive.container is empty"));
        }
        if self.archive.output_dir.as_os_str().is_empty() {
            return Err(AppError::validation("archive.output_dir is empty"));
        }
        if self.storage.backend == StorageBackend::Local
            && self.storage.local_root.as_os_str().is_empty()
        {
            return Err(AppError::validation(
                "storage.local_root is required for the local backend",
            ));
        }
        Ok(())
    }
}

/// SQLite connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "defaults::database_path")]
    pub path: PathBuf,

    /// How long a writer waits on a locked database
    #[serde(default = "defaults::busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: defaults::database_path(),
            busy_timeout_ms: defaults::busy_timeout(),
        }
    }
}

/// Archive dump settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Directory archives are written to when `--output` is not usable
    #[serde(default = "defaults::output_dir")]
    pub output_dir: PathBuf,

    /// Events per archive file, and per delete batch
    #[serde(default = "defaults::chunk_size")]
    pub chunk_size: usize,

    /// Object storage container the archives are uploaded to
    #[serde(default = "defaults::container")]
    pub container: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            output_dir: defaults::output_dir(),
            chunk_size: defaults::chunk_size(),
            container: defaults::container(),
        }
    }
}

/// Which object storage backend archives are uploaded to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// No remote copy; uploads are skipped
    #[default]
    None,
    /// A directory tree standing in for object storage
    Local,
    /// AWS S3 or a compatible service (requires the `s3` feature)
    S3,
}

impl std::str::FromStr for StorageBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(StorageBackend::None),
            "local" => Ok(StorageBackend::Local),
            "s3" => Ok(StorageBackend::S3),
            other => Err(AppError::config(format!(
                "unknown storage backend '{other}'"
            ))),
        }
    }
}

/// Object storage gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Root directory for the local backend
    #[serde(default = "defaults::local_root")]
    pub local_root: PathBuf,

    /// Custom endpoint for S3-compatible services
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            local_root: defaults::local_root(),
            endpoint_url: None,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn database_path() -> PathBuf {
        PathBuf::from("linkstats.db")
    }
    pub fn busy_timeout() -> u64 {
        5_000
    }

    pub fn output_dir() -> PathBuf {
        PathBuf::from("backup")
    }
    pub fn chunk_size() -> usize {
        10_000
    }
    pub fn container() -> String {
        "archive-linkevents".into()
    }

    pub fn local_root() -> PathBuf {
        PathBuf::from("object-storage")
    }

    pub fn log_level() -> String {
        "info".into()
    }
}
