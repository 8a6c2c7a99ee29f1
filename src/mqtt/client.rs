//! Broker client capability interface
//!
//! The connection state machine never talks to `rumqttc` directly. It sees a
//! [`BrokerClient`] that queues requests and hands back [`Completion`]s, and it registers
//! itself as the [`LifecycleHandler`] that the client calls back on its own task.

use super::config::TlsSettings;
use crate::error::BrokerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Delivery guarantee requested for a subscription or publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid QoS level {0}, expected 0, 1 or 2")]
pub struct InvalidQos(pub u8);

impl Qos {
    pub const ALL: [Qos; 3] = [Qos::AtMostOnce, Qos::AtLeastOnce, Qos::ExactlyOnce];

    pub fn label(&self) -> &'static str {
        match self {
            Qos::AtMostOnce => "At most once",
            Qos::AtLeastOnce => "At least once",
            Qos::ExactlyOnce => "Exactly once",
        }
    }
}

impl TryFrom<u8> for Qos {
    type Error = InvalidQos;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(InvalidQos(other)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> u8 {
        qos as u8
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> rumqttc::QoS {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", *self as u8, self.label())
    }
}

/// The broker endpoint a connection attempt is aimed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl fmt::Display for BrokerTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "mqtt" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Callback bound to one subscription filter, invoked with `(topic, payload)`
pub type MessageHandler = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;

/// Lifecycle notifications, invoked on the client's own task
pub trait LifecycleHandler: Send + Sync {
    fn on_connect(&self);

    fn on_connection_lost(&self, err: BrokerError);

    fn on_reconnecting(&self);

    /// Called before every connection attempt; may inspect or replace the TLS settings
    fn on_connect_attempt(
        &self,
        target: &BrokerTarget,
        tls: Option<TlsSettings>,
    ) -> Option<TlsSettings>;
}

/// Operations a broker client library must provide.
///
/// None of these block: requests are queued and their outcome is reported through the
/// returned [`Completion`].
pub trait BrokerClient: Send + Sync {
    fn connect(&self, handler: Arc<dyn LifecycleHandler>) -> Result<(), BrokerError>;

    fn disconnect(&self, grace: Duration);

    fn subscribe(&self, filter: &str, qos: Qos, on_message: MessageHandler) -> Completion;

    fn unsubscribe(&self, filter: &str) -> Completion;

    fn publish(&self, topic: &str, qos: Qos, retain: bool, payload: Vec<u8>) -> Completion;
}

/// Resolves a [`Completion`]
#[derive(Debug)]
pub struct CompletionSender(oneshot::Sender<Result<(), BrokerError>>);

impl CompletionSender {
    pub fn resolve(self, result: Result<(), BrokerError>) {
        // the waiter may have timed out already
        let _ = self.0.send(result);
    }
}

/// Handle on the outcome of an asynchronous broker operation
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), BrokerError>>,
    timeout: Option<Duration>,
}

impl Completion {
    /// A pending completion; `timeout` bounds how long [`wait`](Self::wait) may take
    pub fn channel(timeout: Option<Duration>) -> (CompletionSender, Completion) {
        let (tx, rx) = oneshot::channel();
        (CompletionSender(tx), Completion { rx, timeout })
    }

    /// A completion that is already resolved
    pub fn done(result: Result<(), BrokerError>) -> Completion {
        let (tx, completion) = Completion::channel(None);
        tx.resolve(result);
        completion
    }

    pub async fn wait(self) -> Result<(), BrokerError> {
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.rx).await {
                Ok(result) => result.unwrap_or(Err(BrokerError::Closed)),
                Err(_) => Err(BrokerError::Timeout(limit.as_secs())),
            },
            None => self.rx.await.unwrap_or(Err(BrokerError::Closed)),
        }
    }
}
