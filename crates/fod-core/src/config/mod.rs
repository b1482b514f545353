//! Daemon configuration.
//!
//! Configuration is loaded from a TOML file whose path comes from the
//! `--config` argument or the `DYNAMO_SERVER_CONFIG` environment variable.
//! The section layout mirrors the operations config shared with the file
//! operations manager: `user`, `[logging]`, `[file_operations.daemon]`,
//! `[file_operations.manager.db]`, and the `[classifier]` override table.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable holding the config file path.
pub const CONFIG_ENV: &str = "DYNAMO_SERVER_CONFIG";

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FodConfig {
    /// Account to drop privileges to when started as root.
    #[serde(default)]
    pub user: Option<String>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// File-operations sections shared with the manager.
    #[serde(default)]
    pub file_operations: FileOperations,

    /// Error classifier overrides.
    #[serde(default)]
    pub classifier: ClassifierConfig,
}

impl FodConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Load configuration from the path named by `DYNAMO_SERVER_CONFIG`.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is unset or the file is unreadable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).map_err(|_| ConfigError::EnvUnset)?;
        Self::from_file(path)
    }

    /// The daemon section.
    #[must_use]
    pub const fn daemon(&self) -> &DaemonSection {
        &self.file_operations.daemon
    }

    /// Path to the task database.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.file_operations.manager.db.db_params.path
    }

    /// Proxy used for staging requests; falls back to the transfer proxy.
    #[must_use]
    pub fn staging_proxy(&self) -> Option<&Path> {
        self.file_operations
            .daemon
            .staging_x509_proxy
            .as_deref()
            .or(self.file_operations.daemon.x509_proxy.as_deref())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path; stderr when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Maximum log file size before rotation.
    #[serde(default = "default_log_max_size")]
    pub max_size: u64,

    /// Number of rotated files to keep.
    #[serde(default = "default_log_max_files")]
    pub max_files: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_log_max_size() -> u64 {
    10 * 1024 * 1024 // 10 MB
}

const fn default_log_max_files() -> u32 {
    100
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: None,
            max_size: default_log_max_size(),
            max_files: default_log_max_files(),
        }
    }
}

/// `file_operations` umbrella section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileOperations {
    /// Daemon tuning.
    #[serde(default)]
    pub daemon: DaemonSection,

    /// Manager-owned sections the daemon reads.
    #[serde(default)]
    pub manager: ManagerSection,
}

/// `file_operations.daemon` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSection {
    /// Concurrent operations per source-destination link (and per site pool).
    #[serde(default = "default_max_parallel_links")]
    pub max_parallel_links: usize,

    /// Timeout pushed into transfer parameters.
    #[serde(default = "default_transfer_timeout")]
    #[serde(with = "humantime_serde")]
    pub transfer_timeout: Duration,

    /// Overwrite existing destination files.
    #[serde(default)]
    pub overwrite: bool,

    /// X.509 proxy for transfers and deletions.
    #[serde(default)]
    pub x509_proxy: Option<PathBuf>,

    /// X.509 proxy for staging requests; defaults to `x509_proxy`.
    #[serde(default)]
    pub staging_x509_proxy: Option<PathBuf>,

    /// Verbosity passed to the gfal2 tooling.
    #[serde(default = "default_gfal2_verbosity")]
    pub gfal2_verbosity: String,

    /// Period of the scheduler control loop.
    #[serde(default = "default_schedule_interval")]
    #[serde(with = "humantime_serde")]
    pub schedule_interval: Duration,

    /// Period of the pool collectors' result scan.
    #[serde(default = "default_collect_interval")]
    #[serde(with = "humantime_serde")]
    pub collect_interval: Duration,
}

const fn default_max_parallel_links() -> usize {
    4
}

const fn default_transfer_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_gfal2_verbosity() -> String {
    "warning".to_string()
}

const fn default_schedule_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_collect_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            max_parallel_links: default_max_parallel_links(),
            transfer_timeout: default_transfer_timeout(),
            overwrite: false,
            x509_proxy: None,
            staging_x509_proxy: None,
            gfal2_verbosity: default_gfal2_verbosity(),
            schedule_interval: default_schedule_interval(),
            collect_interval: default_collect_interval(),
        }
    }
}

/// `file_operations.manager` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerSection {
    /// Database settings.
    #[serde(default)]
    pub db: DbSection,
}

/// `file_operations.manager.db` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbSection {
    /// Connection parameters for the task database.
    #[serde(default)]
    pub db_params: DbParams,
}

/// Database connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbParams {
    /// Path to the database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/fod/fod.db")
}

impl Default for DbParams {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// `[classifier]` section: error disposition overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Exit codes that must never be retried.
    #[serde(default = "default_irrecoverable")]
    pub irrecoverable: Vec<i32>,

    /// Message-substring to exit-code overrides; a match wins over the
    /// numeric exit code.
    #[serde(default = "default_message_codes")]
    pub message_codes: Vec<MessageCode>,
}

/// One message-substring override entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCode {
    /// Case-sensitive substring searched in the gateway message.
    pub substring: String,

    /// Exit code assigned when the substring matches.
    pub code: i32,
}

fn default_irrecoverable() -> Vec<i32> {
    // EPERM, EACCES, EFAULT, EINVAL, EPROTONOSUPPORT: authentication,
    // permission, and bad-URL failures that retries cannot fix.
    vec![1, 13, 14, 22, 93]
}

fn default_message_codes() -> Vec<MessageCode> {
    let table = [
        ("Permission denied", 13),
        ("Access denied", 13),
        ("Could not load client credentials", 1),
        ("Invalid credential", 1),
        ("No such file", 2),
        ("File exists", 17),
        ("Invalid argument", 22),
        ("Protocol not supported", 93),
        ("Communication error on send", 70),
    ];
    table
        .into_iter()
        .map(|(substring, code)| MessageCode {
            substring: substring.to_string(),
            code,
        })
        .collect()
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            irrecoverable: default_irrecoverable(),
            message_codes: default_message_codes(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        /// Path that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file could not be parsed.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// `DYNAMO_SERVER_CONFIG` is not set.
    #[error("DYNAMO_SERVER_CONFIG is not set and no --config was given")]
    EnvUnset,
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FodConfig::default();
        assert_eq!(config.daemon().max_parallel_links, 4);
        assert_eq!(config.daemon().transfer_timeout, Duration::from_secs(3600));
        assert!(!config.daemon().overwrite);
        assert_eq!(config.logging.max_size, 10 * 1024 * 1024);
        assert_eq!(config.logging.max_files, 100);
    }

    #[test]
    fn test_parse_full_file() {
        let raw = r#"
            user = "fodagent"

            [logging]
            level = "debug"
            path = "/var/log/fod/daemon.log"

            [file_operations.daemon]
            max_parallel_links = 8
            transfer_timeout = "30m"
            overwrite = true
            x509_proxy = "/tmp/x509up_u500"
            gfal2_verbosity = "debug"

            [file_operations.manager.db]
            db_params = { path = "/tmp/fod-test.db" }

            [[classifier.message_codes]]
            substring = "server certificate"
            code = 1
        "#;
        let config: FodConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.user.as_deref(), Some("fodagent"));
        assert_eq!(config.daemon().max_parallel_links, 8);
        assert_eq!(config.daemon().transfer_timeout, Duration::from_secs(1800));
        assert!(config.daemon().overwrite);
        assert_eq!(config.db_path(), Path::new("/tmp/fod-test.db"));
        assert_eq!(config.classifier.message_codes.len(), 1);
    }

    #[test]
    fn test_staging_proxy_falls_back() {
        let raw = r#"
            [file_operations.daemon]
            x509_proxy = "/tmp/proxy"
        "#;
        let config: FodConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.staging_proxy(), Some(Path::new("/tmp/proxy")));

        let raw = r#"
            [file_operations.daemon]
            x509_proxy = "/tmp/proxy"
            staging_x509_proxy = "/tmp/staging-proxy"
        "#;
        let config: FodConfig = toml::from_str(raw).unwrap();
        assert_eq!(
            config.staging_proxy(),
            Some(Path::new("/tmp/staging-proxy"))
        );
    }

    #[test]
    fn test_from_file_missing() {
        let result = FodConfig::from_file("/nonexistent/fod.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
