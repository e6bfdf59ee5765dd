//! Switchboard configuration file handling
//!
//! Operator settings only: where documents are stored, lifecycle timing,
//! webhook delivery and logging. Per-instance settings (callback URL, access
//! key) live in the `instances` collection, not here.
//!
//! Durations are human-readable strings (`"60s"`, `"1s"`, `"10s"`).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use switchboard::session::SessionConfig;
use switchboard::transport::RetryPolicy;
use thiserror::Error;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_PAIRING_TIMEOUT: &str = "60s";
const DEFAULT_RESTART_DELAY: &str = "1s";
const DEFAULT_MAX_PAIRING_ATTEMPTS: u32 = 5;
const DEFAULT_WEBHOOK_TIMEOUT: &str = "10s";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config file '{path}': {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid duration for {field}: {source}")]
    Duration {
        field: &'static str,
        source: humantime::DurationError,
    },
}

/// Operator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    pub storage: StorageConfig,

    #[serde(default)]
    pub sessions: SessionsConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Document store location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database holding instance, credential and message documents
    pub db_path: PathBuf,
}

/// Lifecycle timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout: String,

    #[serde(default = "default_restart_delay")]
    pub restart_delay: String,

    #[serde(default = "default_max_pairing_attempts")]
    pub max_pairing_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Per-request timeout for callback POSTs
    #[serde(default = "default_webhook_timeout")]
    pub timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_pairing_timeout() -> String {
    DEFAULT_PAIRING_TIMEOUT.to_string()
}

fn default_restart_delay() -> String {
    DEFAULT_RESTART_DELAY.to_string()
}

fn default_max_pairing_attempts() -> u32 {
    DEFAULT_MAX_PAIRING_ATTEMPTS
}

fn default_webhook_timeout() -> String {
    DEFAULT_WEBHOOK_TIMEOUT.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            pairing_timeout: default_pairing_timeout(),
            restart_delay: default_restart_delay(),
            max_pairing_attempts: DEFAULT_MAX_PAIRING_ATTEMPTS,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: default_webhook_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|source| ConfigError::Duration { field, source })
}

impl SwitchboardConfig {
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            storage: StorageConfig { db_path },
            sessions: SessionsConfig::default(),
            webhook: WebhookConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path`, or fall back to defaults when it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new(default_db_path()))
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        write_file(path, &contents)
    }

    /// Lifecycle settings for the session manager
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        Ok(SessionConfig {
            pairing_timeout: parse_duration(
                "sessions.pairing_timeout",
                &self.sessions.pairing_timeout,
            )?,
            restart_delay: parse_duration("sessions.restart_delay", &self.sessions.restart_delay)?,
            max_pairing_attempts: self.sessions.max_pairing_attempts,
            retry: RetryPolicy::default(),
        })
    }

    pub fn webhook_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("webhook.timeout", &self.webhook.timeout)
    }

    /// Default configuration with comments
    pub fn generate_default_toml(db_path: &Path) -> String {
        format!(
            r#"# Switchboard Configuration (Operator Settings)
#
# Per-instance settings (callback URL, access key, phone number) are stored
# with each instance and managed through the control operations, not here.

[storage]
# SQLite database holding instance, credential and message documents
db_path = "{db_path}"

[sessions]
# How long an instance may wait in pairing before the session is recreated
pairing_timeout = "{pairing_timeout}"

# Delay before the one-shot restart that follows a fresh pairing
restart_delay = "{restart_delay}"

# Pairing watchdog expiries before the instance is left closed
max_pairing_attempts = {max_pairing_attempts}

[webhook]
# Per-request timeout for callback POSTs (delivery is never retried)
timeout = "{webhook_timeout}"

[logging]
# Log level: trace, debug, info, warn, error (RUST_LOG overrides)
level = "{log_level}"
"#,
            db_path = db_path.display(),
            pairing_timeout = DEFAULT_PAIRING_TIMEOUT,
            restart_delay = DEFAULT_RESTART_DELAY,
            max_pairing_attempts = DEFAULT_MAX_PAIRING_ATTEMPTS,
            webhook_timeout = DEFAULT_WEBHOOK_TIMEOUT,
            log_level = DEFAULT_LOG_LEVEL,
        )
    }

    pub fn create_default(config_path: &Path, db_path: &Path) -> Result<(), ConfigError> {
        write_file(config_path, &Self::generate_default_toml(db_path))
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), ConfigError> {
    let write_err = |source: std::io::Error| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    fs::write(path, contents).map_err(write_err)
}

/// `~/.local/share/switchboard` (or the platform equivalent)
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("switchboard")
}

pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

pub fn default_db_path() -> PathBuf {
    default_data_dir().join("switchboard.db")
}

/// `--config` if given, else the default path
pub fn resolve_config_path(config: Option<String>) -> PathBuf {
    config.map(PathBuf::from).unwrap_or_else(default_config_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = SwitchboardConfig::new(PathBuf::from("/data/switchboard.db"));
        let sessions = config.session_config().unwrap();

        assert_eq!(sessions.pairing_timeout, Duration::from_secs(60));
        assert_eq!(sessions.restart_delay, Duration::from_secs(1));
        assert_eq!(sessions.max_pairing_attempts, 5);
        assert_eq!(config.webhook_timeout().unwrap(), Duration::from_secs(10));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut config = SwitchboardConfig::new(temp_dir.path().join("sb.db"));
        config.sessions.pairing_timeout = "2m".to_string();
        config.save(&config_path).unwrap();

        let loaded = SwitchboardConfig::load(&config_path).unwrap();
        assert_eq!(loaded.storage.db_path, temp_dir.path().join("sb.db"));
        assert_eq!(
            loaded.session_config().unwrap().pairing_timeout,
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_generated_default_parses() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let db_path = temp_dir.path().join("switchboard.db");

        SwitchboardConfig::create_default(&config_path, &db_path).unwrap();

        let config = SwitchboardConfig::load(&config_path).unwrap();
        assert_eq!(config.storage.db_path, db_path);
        assert_eq!(config.sessions.max_pairing_attempts, 5);
        assert!(config.session_config().is_ok());
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "[storage]\ndb_path = \"/tmp/sb.db\"\n").unwrap();

        let config = SwitchboardConfig::load(&config_path).unwrap();
        assert_eq!(config.sessions.restart_delay, "1s");
        assert_eq!(config.webhook.timeout, "10s");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_duration_is_reported() {
        let mut config = SwitchboardConfig::new(PathBuf::from("/tmp/sb.db"));
        config.sessions.restart_delay = "soon".to_string();

        match config.session_config() {
            Err(ConfigError::Duration { field, .. }) => assert_eq!(field, "sessions.restart_delay"),
            other => panic!("expected duration error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = SwitchboardConfig::load(&temp_dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
