//! # Persistence Module
//!
//! ## Why This Module Exists
//! Connections and their subscription lists outlive a session. The operator configures a
//! broker once and finds it, with the same topic filters, the next time the program
//! starts. Message history is not persisted.
//!
//! ## Key Abstractions
//! - **Records**: flat, serde-friendly snapshots ([`ConnectionRecord`],
//!   [`SubscriptionRecord`]) separate from the live, lock-protected runtime types
//! - **[`Persistence`] trait**: the four operations the connection state machine and the
//!   UI need, so tests can swap the file store for an in-memory one
//! - **[`json_store::JsonFileStore`]**: pretty JSON files under the user cache directory,
//!   one file for the connection list and one per connection for its subscriptions
//!
//! ## Error Handling Strategy
//! Writes are synchronous and their failures are returned to the caller, which forwards
//! them to the operator through the event bridge. A session keeps running when the disk
//! does not cooperate. Unreadable subscription lists are treated as empty.

pub mod json_store;

use crate::mqtt::client::Qos;
use crate::mqtt::config::{ConnectionProfile, Credentials, TlsSettings};
use crate::mqtt::connection::ConnectionId;
use crate::mqtt::message::PayloadFormat;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persisted form of a broker connection
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionRecord {
    /// Identity used to find the connection's subscription file
    pub id: ConnectionId,
    pub name: String,
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    /// Verify the broker certificate; only meaningful with `use_tls`
    pub authenticate: bool,
    pub key_file: String,
    pub cert_file: String,
    pub ca_file: String,
}

impl Default for ConnectionRecord {
    fn default() -> Self {
        Self {
            id: ConnectionId::new(),
            name: String::new(),
            broker: String::new(),
            port: 1883,
            client_id: String::new(),
            username: String::new(),
            password: String::new(),
            use_tls: false,
            authenticate: true,
            key_file: String::new(),
            cert_file: String::new(),
            ca_file: String::new(),
        }
    }
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    (!value.is_empty()).then(|| PathBuf::from(value))
}

impl ConnectionRecord {
    pub fn profile(&self) -> ConnectionProfile {
        let credentials = (!self.username.is_empty() || !self.password.is_empty()).then(|| {
            Credentials {
                username: self.username.clone(),
                password: self.password.clone(),
            }
        });

        let tls = self.use_tls.then(|| TlsSettings {
            verify: self.authenticate,
            ca_file: non_empty_path(&self.ca_file),
            cert_file: non_empty_path(&self.cert_file),
            key_file: non_empty_path(&self.key_file),
        });

        ConnectionProfile {
            name: self.name.clone(),
            host: self.broker.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            credentials,
            tls,
        }
    }
}

/// Persisted form of a subscription
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub name: String,
    pub filter: String,
    pub qos: Qos,
    #[serde(default)]
    pub format: PayloadFormat,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("could not access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The file did not parse and was moved aside so the next save cannot overwrite it
    #[error("could not parse {path}, kept it as {backup}: {source}")]
    Corrupt {
        path: PathBuf,
        backup: PathBuf,
        source: serde_json::Error,
    },

    #[error("could not serialize data for {path}: {source}")]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Storage for connection profiles and per-connection subscription lists
pub trait Persistence: Send + Sync {
    fn load_connections(&self) -> Result<Vec<ConnectionRecord>, PersistenceError>;

    fn save_connections(&self, connections: &[ConnectionRecord]) -> Result<(), PersistenceError>;

    fn load_subscriptions(
        &self,
        connection: ConnectionId,
    ) -> Result<Vec<SubscriptionRecord>, PersistenceError>;

    fn save_subscriptions(
        &self,
        connection: ConnectionId,
        subscriptions: &[SubscriptionRecord],
    ) -> Result<(), PersistenceError>;

    /// Drops everything stored for a removed connection
    fn forget_subscriptions(&self, connection: ConnectionId) -> Result<(), PersistenceError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_from_plain_record() {
        let record = ConnectionRecord {
            name: "local".into(),
            broker: "localhost".into(),
            client_id: "deck".into(),
            ..Default::default()
        };
        let profile = record.profile();
        assert_eq!(profile.port, 1883);
        assert_eq!(profile.credentials, None);
        assert_eq!(profile.tls, None);
    }

    #[test]
    fn profile_carries_credentials_and_tls() {
        let record = ConnectionRecord {
            broker: "broker".into(),
            port: 8883,
            username: "alice".into(),
            password: "secret".into(),
            use_tls: true,
            authenticate: false,
            ca_file: " /etc/ca.pem ".into(),
            ..Default::default()
        };
        let profile = record.profile();
        assert_eq!(
            profile.credentials.map(|c| c.username),
            Some("alice".to_string())
        );
        let tls = profile.tls.unwrap();
        assert!(!tls.verify);
        assert_eq!(tls.ca_file, Some(PathBuf::from("/etc/ca.pem")));
        assert_eq!(tls.cert_file, None);
    }

    #[test]
    fn subscription_record_json_shape() {
        let record: SubscriptionRecord =
            serde_json::from_str(r##"{"name":"all","filter":"#","qos":1,"format":"none"}"##)
                .unwrap();
        assert_eq!(record.qos, Qos::AtLeastOnce);
        assert_eq!(record.format, PayloadFormat::Raw);

        let bad = serde_json::from_str::<SubscriptionRecord>(
            r##"{"name":"all","filter":"#","qos":7}"##,
        );
        assert!(bad.is_err());
    }
}
