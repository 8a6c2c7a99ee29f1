use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Username/password pair sent in CONNECT
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// TLS material for one connection, as file paths.
///
/// `verify == false` disables certificate verification; it is only ever set when the
/// operator asked for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    pub verify: bool,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// Everything needed to reach one broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsSettings>,
}

impl ConnectionProfile {
    pub fn target(&self) -> super::client::BrokerTarget {
        super::client::BrokerTarget {
            host: self.host.clone(),
            port: self.port,
            tls: self.tls.is_some(),
        }
    }
}

/// Tuning of the broker client, taken from the application config
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
    pub request_capacity: usize,
    pub ack_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(30),
            reconnect_delay: Duration::from_millis(2000),
            request_capacity: 100,
            ack_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_not_logged() {
        let creds = Credentials {
            username: "alice".into(),
            password: "hunter2".into(),
        };
        let shown = format!("{:?}", creds);
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn target_scheme_follows_tls() {
        let mut profile = ConnectionProfile {
            name: "local".into(),
            host: "localhost".into(),
            port: 1883,
            client_id: "deck".into(),
            credentials: None,
            tls: None,
        };
        assert_eq!(profile.target().to_string(), "mqtt://localhost:1883");
        profile.tls = Some(TlsSettings::default());
        profile.port = 8883;
        assert_eq!(profile.target().to_string(), "mqtts://localhost:8883");
    }
}
