use super::{ConnectionRecord, Persistence, PersistenceError, SubscriptionRecord};
use crate::mqtt::connection::ConnectionId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const APP_DIR: &str = "mqttdeck";
const CONNECTIONS_FILE: &str = "connections.json";

/// JSON files in one directory: `connections.json` plus `<connection-id>.json` per connection
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    base_path: PathBuf,
}

impl JsonFileStore {
    /// Opens (and creates) the store directory
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).map_err(|source| PersistenceError::Io {
            path: base_path.clone(),
            source,
        })?;
        info!("Using data directory {}", base_path.display());
        Ok(Self { base_path })
    }

    /// `<user cache dir>/mqttdeck`, or `./mqttdeck` when there is no cache dir
    pub fn default_dir() -> PathBuf {
        let mut base_path = dirs::cache_dir().unwrap_or_else(|| {
            warn!("Could not determine cache directory, using current directory");
            PathBuf::from(".")
        });
        base_path.push(APP_DIR);
        base_path
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn connections_path(&self) -> PathBuf {
        self.base_path.join(CONNECTIONS_FILE)
    }

    fn subscriptions_path(&self, connection: ConnectionId) -> PathBuf {
        self.base_path.join(format!("{}.json", connection))
    }

    /// Reads a JSON list; a missing file is an empty list
    fn read_list<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, PersistenceError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} does not exist yet", path.display());
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&content).map_err(|source| PersistenceError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write_list<T: Serialize>(path: &Path, items: &[T]) -> Result<(), PersistenceError> {
        let content =
            serde_json::to_string_pretty(items).map_err(|source| PersistenceError::Serialize {
                path: path.to_path_buf(),
                source,
            })?;

        // write next to the target and rename, a crash never leaves half a file behind
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .and_then(|_| fs::rename(&tmp, path))
            .map_err(|source| PersistenceError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        debug!("Wrote {} entries to {}", items.len(), path.display());
        Ok(())
    }
}

impl Persistence for JsonFileStore {
    /// An unparsable connection list is renamed to `connections.json.bak` before the
    /// error is returned, so the next save starts a fresh file next to it.
    fn load_connections(&self) -> Result<Vec<ConnectionRecord>, PersistenceError> {
        match Self::read_list(&self.connections_path()) {
            Err(PersistenceError::Parse { path, source }) => {
                let backup = path.with_extension("json.bak");
                fs::rename(&path, &backup).map_err(|e| PersistenceError::Io {
                    path: path.clone(),
                    source: e,
                })?;
                warn!("Moved unreadable {} to {}", path.display(), backup.display());
                Err(PersistenceError::Corrupt {
                    path,
                    backup,
                    source,
                })
            }
            other => other,
        }
    }

    fn save_connections(&self, connections: &[ConnectionRecord]) -> Result<(), PersistenceError> {
        Self::write_list(&self.connections_path(), connections)
    }

    fn load_subscriptions(
        &self,
        connection: ConnectionId,
    ) -> Result<Vec<SubscriptionRecord>, PersistenceError> {
        Self::read_list(&self.subscriptions_path(connection))
    }

    fn save_subscriptions(
        &self,
        connection: ConnectionId,
        subscriptions: &[SubscriptionRecord],
    ) -> Result<(), PersistenceError> {
        Self::write_list(&self.subscriptions_path(connection), subscriptions)
    }

    fn forget_subscriptions(&self, connection: ConnectionId) -> Result<(), PersistenceError> {
        let path = self.subscriptions_path(connection);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed subscriptions of connection {}", connection);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PersistenceError::Io { path, source }),
        }
    }
}
