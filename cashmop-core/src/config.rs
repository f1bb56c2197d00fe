//! Configuration loading and management
//!
//! Configuration is loaded from `<config dir>/cashmop/config.toml`, where the
//! config dir is `$XDG_CONFIG_HOME` when set and the platform default
//! otherwise (`~/.config` on Linux, `~/Library/Application Support` on macOS,
//! `%APPDATA%` on Windows).
//!
//! The live database sits in the same directory unless `storage.path` or
//! `APP_ENV` says otherwise.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Application directory name under the config/state roots.
pub const APP_DIR: &str = "cashmop";

/// Returns XDG_CONFIG_HOME or the per-OS config directory
fn config_home() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_STATE_HOME or the per-OS local data directory
fn state_home() -> PathBuf {
    std::env::var_os("XDG_STATE_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::state_dir)
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Which runtime environment the process is in, from `APP_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Production,
    Development,
    Test,
}

impl AppEnv {
    /// Read `APP_ENV` from the process environment.
    pub fn current() -> Self {
        Self::parse(std::env::var("APP_ENV").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("test") => AppEnv::Test,
            Some("dev") | Some("development") => AppEnv::Development,
            _ => AppEnv::Production,
        }
    }
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Database location and connection settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Backup and retention settings
    #[serde(default)]
    pub backup: BackupConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database location and connection settings
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Explicit database path; overrides the environment-derived default
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Maximum pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// SQLite busy timeout applied to every connection, in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_pool_size() -> u32 {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

/// Where retention reads a snapshot's age from.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    /// Timestamp embedded in the file name, falling back to mtime
    #[default]
    FileName,
    /// File modification time only
    ModifiedTime,
}

/// Backup and retention settings
#[derive(Debug, Deserialize, Clone)]
pub struct BackupConfig {
    /// Prefix for every snapshot file name
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    /// Hours after which a new automatic backup is due
    #[serde(default = "default_auto_backup_interval_hours")]
    pub auto_backup_interval_hours: u32,

    /// Wall-clock budget for retrying a contended backup, in seconds
    #[serde(default = "default_create_timeout_secs")]
    pub create_timeout_secs: u64,

    /// Most recent automatic backups always kept
    #[serde(default = "default_daily_keep")]
    pub daily_keep: usize,

    /// Distinct ISO weeks kept beyond the daily tail
    #[serde(default = "default_weekly_keep")]
    pub weekly_keep: usize,

    /// Where retention reads a snapshot's age from
    #[serde(default)]
    pub timestamp_source: TimestampSource,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            file_prefix: default_file_prefix(),
            auto_backup_interval_hours: default_auto_backup_interval_hours(),
            create_timeout_secs: default_create_timeout_secs(),
            daily_keep: default_daily_keep(),
            weekly_keep: default_weekly_keep(),
            timestamp_source: TimestampSource::default(),
        }
    }
}

impl BackupConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.file_prefix.is_empty()
            || !self
                .file_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::Config(
                "backup.file_prefix must be non-empty and contain only letters, digits or '-'"
                    .to_string(),
            ));
        }
        if self.auto_backup_interval_hours == 0 {
            return Err(Error::Config(
                "backup.auto_backup_interval_hours must be at least 1".to_string(),
            ));
        }
        if self.daily_keep == 0 {
            return Err(Error::Config(
                "backup.daily_keep must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_file_prefix() -> String {
    APP_DIR.to_string()
}

fn default_auto_backup_interval_hours() -> u32 {
    24
}

fn default_create_timeout_secs() -> u64 {
    30
}

fn default_daily_keep() -> usize {
    10
}

fn default_weekly_keep() -> usize {
    5
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.backup.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `<config dir>/cashmop/config.toml`
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Returns the per-OS application directory, which also holds the
    /// production database
    pub fn config_dir() -> PathBuf {
        config_home().join(APP_DIR)
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        state_home().join(APP_DIR)
    }

    /// Resolve the live database path.
    ///
    /// An explicit `storage.path` wins. Otherwise `APP_ENV=test` and
    /// `APP_ENV=dev` use `./tmp/cashmop_<suffix>.db` (test runs may be
    /// sharded with `CASHMOP_WORKER_ID`), and production uses
    /// `<config dir>/cashmop/cashmop.db`.
    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.storage.path {
            return path.clone();
        }
        let worker = std::env::var("CASHMOP_WORKER_ID").ok();
        resolve_database_path(AppEnv::current(), worker.as_deref(), &Self::config_dir())
    }
}

fn resolve_database_path(env: AppEnv, worker_id: Option<&str>, config_dir: &Path) -> PathBuf {
    let local = |suffix: &str| PathBuf::from("tmp").join(format!("{APP_DIR}_{suffix}.db"));
    match env {
        AppEnv::Test => match worker_id.filter(|w| !w.is_empty()) {
            Some(worker) => local(&format!("test_w{worker}")),
            None => local("test"),
        },
        AppEnv::Development => local("dev"),
        AppEnv::Production => config_dir.join(format!("{APP_DIR}.db")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.storage.path.is_none());
        assert_eq!(config.storage.pool_size, 4);
        assert_eq!(config.storage.busy_timeout_ms, 5000);
        assert_eq!(config.backup.file_prefix, "cashmop");
        assert_eq!(config.backup.daily_keep, 10);
        assert_eq!(config.backup.weekly_keep, 5);
        assert_eq!(config.backup.auto_backup_interval_hours, 24);
        assert_eq!(config.backup.timestamp_source, TimestampSource::FileName);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[storage]
path = "/data/cashmop.db"
pool_size = 2

[backup]
daily_keep = 7
timestamp_source = "modified_time"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.storage.path, Some(PathBuf::from("/data/cashmop.db")));
        assert_eq!(config.storage.pool_size, 2);
        assert_eq!(config.storage.busy_timeout_ms, 5000);
        assert_eq!(config.backup.daily_keep, 7);
        assert_eq!(config.backup.weekly_keep, 5);
        assert_eq!(config.backup.timestamp_source, TimestampSource::ModifiedTime);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.database_path(), PathBuf::from("/data/cashmop.db"));
    }

    #[test]
    fn test_backup_config_validation() {
        assert!(BackupConfig::default().validate().is_ok());

        let config = BackupConfig {
            file_prefix: "bad_prefix".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BackupConfig {
            auto_backup_interval_hours: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_rejects_invalid_backup_section() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[backup]\ndaily_keep = 0\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("daily_keep"));
    }

    #[test]
    fn test_app_env_parse() {
        assert_eq!(AppEnv::parse(Some("test")), AppEnv::Test);
        assert_eq!(AppEnv::parse(Some(" TEST ")), AppEnv::Test);
        assert_eq!(AppEnv::parse(Some("development")), AppEnv::Development);
        assert_eq!(AppEnv::parse(Some("dev")), AppEnv::Development);
        assert_eq!(AppEnv::parse(Some("prod")), AppEnv::Production);
        assert_eq!(AppEnv::parse(None), AppEnv::Production);
    }

    #[test]
    fn test_resolve_database_path() {
        let config_dir = PathBuf::from("/home/u/.config/cashmop");

        assert_eq!(
            resolve_database_path(AppEnv::Production, None, &config_dir),
            config_dir.join("cashmop.db")
        );
        assert_eq!(
            resolve_database_path(AppEnv::Test, None, &config_dir),
            PathBuf::from("tmp/cashmop_test.db")
        );
        assert_eq!(
            resolve_database_path(AppEnv::Test, Some("3"), &config_dir),
            PathBuf::from("tmp/cashmop_test_w3.db")
        );
        assert_eq!(
            resolve_database_path(AppEnv::Development, Some("3"), &config_dir),
            PathBuf::from("tmp/cashmop_dev.db")
        );
    }
}
