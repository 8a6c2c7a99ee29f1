//! Error types shared by the broker bridge, the connection state machine and the UI loop.
//!
//! Everything that reaches the operator travels as a [`CoreError`] through the event
//! bridge's error channel, so these types are `Clone` and carry rendered messages instead
//! of the underlying library errors.

use crate::mqtt::subscription::SubscriptionId;
use thiserror::Error;

/// Failures reported by a broker client implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The request could not be handed to the client (queue full, client closed, invalid filter)
    #[error("request failed: {0}")]
    Request(String),

    /// The broker answered with a failure code
    #[error("rejected by broker: {0}")]
    Rejected(String),

    /// Transport level failure of the session
    #[error("connection error: {0}")]
    Connection(String),

    /// No acknowledgement arrived within the client's acknowledgement timeout
    #[error("no acknowledgement after {0}s")]
    Timeout(u64),

    /// The client went away before the operation completed
    #[error("client closed before the operation completed")]
    Closed,
}

/// Errors surfaced to the operator through the event bridge
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("lost connection: {0}")]
    ConnectionLost(BrokerError),

    #[error("could not connect: {0}")]
    Connect(BrokerError),

    #[error("subscribe to '{filter}' failed: {source}")]
    Subscribe { filter: String, source: BrokerError },

    #[error("unsubscribe from '{filter}' failed: {source}")]
    Unsubscribe { filter: String, source: BrokerError },

    #[error("publish to '{topic}' failed: {source}")]
    Publish { topic: String, source: BrokerError },

    #[error("unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<crate::persistence::PersistenceError> for CoreError {
    fn from(e: crate::persistence::PersistenceError) -> Self {
        CoreError::Persistence(e.to_string())
    }
}
