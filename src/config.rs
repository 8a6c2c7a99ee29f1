//! Application configuration.
//!
//! Read once at startup from `<config dir>/mqttdeck/config.toml`, or from the file named
//! by `MQTTDECK_CONFIG`. Every field has a default, so a partial file is fine. A missing
//! file means defaults; an unreadable one is logged and also means defaults.

use crate::mqtt::config::ClientSettings;
use crate::persistence::json_store::JsonFileStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn, Level};

pub const CONFIG_ENV: &str = "MQTTDECK_CONFIG";
const APP_DIR: &str = "mqttdeck";
const CONFIG_FILE: &str = "config.toml";
const MIN_KEEP_ALIVE_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {0} does not exist")]
    Missing(PathBuf),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    /// `error`, `warn`, `info`, `debug` or `trace`
    pub log_level: String,
    /// How long an error stays on screen
    pub error_display_secs: u64,
    /// Time given to in-flight work when a connection is closed
    pub disconnect_grace_ms: u64,
    pub keep_alive_secs: u64,
    pub reconnect_delay_ms: u64,
    /// Requests rumqttc buffers before `try_*` calls start failing
    pub request_capacity: usize,
    pub ack_timeout_secs: u64,
    /// Where connections and subscriptions are stored, instead of the cache directory
    pub data_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            error_display_secs: 10,
            disconnect_grace_ms: 100,
            keep_alive_secs: 30,
            reconnect_delay_ms: 2000,
            request_capacity: 100,
            ack_timeout_secs: 30,
            data_dir: None,
        }
    }
}

impl AppConfig {
    /// `$MQTTDECK_CONFIG`, else `<config dir>/mqttdeck/config.toml`
    pub fn path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(APP_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn load() -> Self {
        Self::load_or_default(&Self::path())
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load_from(path) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(ConfigError::Missing(_)) => {
                debug!("No config at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => ConfigError::Missing(path.to_path_buf()),
            _ => ConfigError::Read {
                path: path.to_path_buf(),
                source,
            },
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn log_level(&self) -> Level {
        Level::from_str(self.log_level.trim()).unwrap_or_else(|_| {
            warn!("Unknown log level '{}', using info", self.log_level);
            Level::INFO
        })
    }

    pub fn error_display(&self) -> Duration {
        Duration::from_secs(self.error_display_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(JsonFileStore::default_dir)
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            keep_alive: Duration::from_secs(self.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS)),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            request_capacity: self.request_capacity.max(1),
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_client_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.client_settings(), ClientSettings::default());
        assert_eq!(config.error_display(), Duration::from_secs(10));
        assert_eq!(config.disconnect_grace(), Duration::from_millis(100));
        assert_eq!(config.log_level(), Level::INFO);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "log_level = \"debug\"\nkeep_alive_secs = 2\ndata_dir = \"/tmp/deck\"\n",
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.log_level(), Level::DEBUG);
        assert_eq!(config.error_display_secs, 10);
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/deck"));
        // rumqttc needs at least five seconds
        assert_eq!(config.client_settings().keep_alive, Duration::from_secs(5));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::Missing(_))
        ));
        assert_eq!(AppConfig::load_or_default(&path), AppConfig::default());
    }

    #[test]
    fn broken_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "error_display_secs = \"ten\"").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
        assert_eq!(AppConfig::load_or_default(&path), AppConfig::default());
    }

    #[test]
    fn unknown_log_level_falls_back() {
        let config = AppConfig {
            log_level: "loud".into(),
            ..Default::default()
        };
        assert_eq!(config.log_level(), Level::INFO);
    }
}
