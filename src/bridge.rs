//! # Event Bridge
//!
//! The only path by which background work talks to the UI loop. Broker callbacks,
//! completion waiters and the error-notice timer all hold a clone of [`EventBridge`] and
//! push [`UiEvent`]s into one unbounded queue; the UI loop owns the matching
//! [`EventReceiver`] and drains it on its own task.
//!
//! The pair is created once at startup by [`EventBridge::channel`], so there is no way to
//! emit an event before the sink exists and no way to attach a second sink.
//!
//! ```text
//! rumqttc driver ─┐
//! waiters ────────┼─► EventBridge ─[unbounded mpsc]─► EventReceiver ─► UI loop
//! notice timer ───┘
//! ```

use crate::error::CoreError;
use crate::mqtt::connection::{ConnectionId, ConnectionState};
use crate::mqtt::subscription::SubscriptionId;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Notifications consumed by the UI loop
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// A connection's lifecycle state changed
    StateChanged {
        connection: ConnectionId,
        state: ConnectionState,
    },

    /// A message was appended to a subscription's log
    MessageReceived {
        connection: ConnectionId,
        subscription: SubscriptionId,
    },

    /// Show an error, or clear the displayed one with `None`
    Error(Option<CoreError>),

    /// The display timer of the error with this generation ran out
    ErrorExpired { generation: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("UI event queue is closed")]
    Closed,
}

/// Sending half handed to every component that emits UI events
#[derive(Debug, Clone)]
pub struct EventBridge {
    sink: mpsc::UnboundedSender<UiEvent>,
}

/// Receiving half owned by the UI loop
#[derive(Debug)]
pub struct EventReceiver {
    source: mpsc::UnboundedReceiver<UiEvent>,
}

impl EventBridge {
    pub fn channel() -> (EventBridge, EventReceiver) {
        let (sink, source) = mpsc::unbounded_channel();
        (EventBridge { sink }, EventReceiver { source })
    }

    /// Enqueues an event without blocking.
    ///
    /// Must not be used by the UI loop to talk to itself for state, message or error
    /// events; the loop handles those synchronously.
    pub fn notify(&self, event: UiEvent) -> Result<(), BridgeError> {
        debug!("Bridging event {:?}", event);
        self.sink.send(event).map_err(|_| BridgeError::Closed)
    }

    /// Like [`notify`](Self::notify) but logs a closed queue instead of returning it.
    ///
    /// Background tasks have nobody to hand the failure to.
    pub fn emit(&self, event: UiEvent) {
        if let Err(e) = self.notify(event) {
            error!("Dropping UI event: {}", e);
        }
    }

    pub fn report_error(&self, err: CoreError) {
        self.emit(UiEvent::Error(Some(err)));
    }

    pub fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<UiEvent> {
        self.source.recv().await
    }

    pub fn try_recv(&mut self) -> Option<UiEvent> {
        self.source.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;

    #[tokio::test]
    async fn events_arrive_in_send_order() {
        let (bridge, mut rx) = EventBridge::channel();
        let connection = ConnectionId::new();

        bridge.emit(UiEvent::StateChanged {
            connection,
            state: ConnectionState::Connected,
        });
        bridge.report_error(CoreError::ConnectionLost(BrokerError::Closed));

        assert_eq!(
            rx.recv().await,
            Some(UiEvent::StateChanged {
                connection,
                state: ConnectionState::Connected
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(UiEvent::Error(Some(CoreError::ConnectionLost(
                BrokerError::Closed
            ))))
        );
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn notify_from_foreign_thread() {
        let (bridge, mut rx) = EventBridge::channel();
        let worker = bridge.clone();
        std::thread::spawn(move || worker.emit(UiEvent::Error(None)))
            .join()
            .unwrap();

        assert_eq!(rx.try_recv(), Some(UiEvent::Error(None)));
    }

    #[test]
    fn notify_after_receiver_dropped_is_an_error() {
        let (bridge, rx) = EventBridge::channel();
        drop(rx);

        assert!(bridge.is_closed());
        assert!(matches!(
            bridge.notify(UiEvent::Error(None)),
            Err(BridgeError::Closed)
        ));
        // emit swallows the failure
        bridge.emit(UiEvent::Error(None));
    }
}
