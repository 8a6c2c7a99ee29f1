//! # Connection State Machine
//!
//! Tracks one broker session and owns its subscriptions.
//!
//! ```text
//!              attempt (first)          on_connect
//!   ┌──────────┐ ───────────► ┌──────────┐ ─────────► ┌───────────┐
//!   │Connecting│              │Connecting│            │ Connected │◄──────┐
//!   └──────────┘              └──────────┘            └───────────┘       │
//!                                                        │ lost           │ on_connect
//!                                                        ▼                │
//!                                                  ┌────────────┐ attempt ┌────────────┐
//!                                                  │Disconnected│ ──────► │Reconnecting│
//!                                                  └────────────┘         └────────────┘
//! ```
//!
//! The lifecycle callbacks arrive on the broker client's task and only touch the shared
//! half ([`ConnectionShared`]): an atomic state, an atomic "has connected once" flag and
//! the lock-protected subscription list. The [`Connection`] handle itself belongs to the
//! UI loop, which is the only place that adds, removes or selects subscriptions.
//!
//! Every (re)connect re-issues one subscribe per held subscription because the broker
//! session is not assumed to survive a reconnect. Broker operations return completions
//! that are awaited on spawned tasks; failures end up in the bridge's error channel and
//! never roll back the local subscription list.

use super::client::{BrokerClient, BrokerTarget, Completion, LifecycleHandler, MessageHandler, Qos};
use super::config::{ConnectionProfile, TlsSettings};
use super::message::PayloadFormat;
use super::subscription::{CursorDirection, Subscription, SubscriptionId};
use crate::bridge::{EventBridge, UiEvent};
use crate::error::{BrokerError, CoreError};
use crate::persistence::{ConnectionRecord, Persistence, SubscriptionRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Persistent identity of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    Connecting = 0,
    Reconnecting = 1,
    Connected = 2,
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Reconnecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnected,
            _ => ConnectionState::Connecting,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Single-scalar state shared between the callback task (writer) and the UI (reader)
#[derive(Debug, Default)]
struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn swap(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }
}

/// Waits for a broker operation on a background task and reports a failure.
///
/// Never blocks the caller. Without a tokio runtime the outcome cannot be awaited and is
/// only logged.
fn watch_completion<F>(completion: Completion, bridge: &EventBridge, on_error: F)
where
    F: FnOnce(BrokerError) -> CoreError + Send + 'static,
{
    let bridge = bridge.clone();
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if let Err(e) = completion.wait().await {
                    let err = on_error(e);
                    warn!("{}", err);
                    bridge.report_error(err);
                }
            });
        }
        Err(e) => error!("No runtime to await broker operation: {}", e),
    }
}

/// The half of a connection reachable from the broker client's callbacks
pub struct ConnectionShared {
    this: Weak<ConnectionShared>,
    id: ConnectionId,
    name: String,
    state: AtomicConnectionState,
    has_connected_once: AtomicBool,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    client: Arc<dyn BrokerClient>,
    bridge: EventBridge,
}

impl ConnectionShared {
    fn subscriptions(&self) -> RwLockReadGuard<'_, Vec<Arc<Subscription>>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions_mut(&self) -> RwLockWriteGuard<'_, Vec<Arc<Subscription>>> {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.swap(state);
        if previous == state {
            return;
        }
        info!("Connection '{}': {} -> {}", self.name, previous, state);
        self.bridge.emit(UiEvent::StateChanged {
            connection: self.id,
            state,
        });
    }

    /// Delivers into every listed subscription on `filter`.
    ///
    /// The broker client keeps one handler per filter, so subscriptions sharing a filter
    /// are looked up at delivery time instead of each registering their own.
    fn route(&self, filter: &str) -> MessageHandler {
        let this = self.this.clone();
        let filter = filter.to_string();
        Arc::new(move |topic: String, payload: Vec<u8>| {
            let Some(shared) = this.upgrade() else {
                debug!("Dropping message on {} for a closed connection", topic);
                return;
            };
            let targets: Vec<Arc<Subscription>> = shared
                .subscriptions()
                .iter()
                .filter(|s| s.filter() == filter)
                .cloned()
                .collect();
            match targets.split_last() {
                None => debug!("Dropping message on {} for a removed subscription", topic),
                Some((last, rest)) => {
                    for subscription in rest {
                        subscription.ingest(topic.clone(), payload.clone());
                    }
                    last.ingest(topic, payload);
                }
            }
        })
    }

    /// Issues the broker subscribe for one store, routing deliveries into its log
    fn issue_subscribe(&self, subscription: &Arc<Subscription>) {
        let on_message = self.route(subscription.filter());
        let filter = subscription.filter().to_string();
        debug!("Subscribing to {} with {}", filter, subscription.qos());
        let completion = self
            .client
            .subscribe(&filter, subscription.qos(), on_message);
        watch_completion(completion, &self.bridge, move |source| {
            CoreError::Subscribe { filter, source }
        });
    }
}

impl LifecycleHandler for ConnectionShared {
    fn on_connect(&self) {
        self.has_connected_once.store(true, Ordering::Release);
        self.set_state(ConnectionState::Connected);

        let held: Vec<Arc<Subscription>> = self.subscriptions().clone();
        info!(
            "Connection '{}' established, restoring {} subscriptions",
            self.name,
            held.len()
        );
        for subscription in &held {
            self.issue_subscribe(subscription);
        }
    }

    fn on_connection_lost(&self, err: BrokerError) {
        warn!("Connection '{}' lost: {}", self.name, err);
        self.set_state(ConnectionState::Disconnected);
        self.bridge.report_error(CoreError::ConnectionLost(err));
    }

    fn on_reconnecting(&self) {
        self.set_state(ConnectionState::Reconnecting);
    }

    fn on_connect_attempt(
        &self,
        target: &BrokerTarget,
        tls: Option<TlsSettings>,
    ) -> Option<TlsSettings> {
        let state = if self.has_connected_once.load(Ordering::Acquire) {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        debug!("Connection '{}' attempting {}", self.name, target);
        self.set_state(state);
        tls
    }
}

/// A broker connection as seen by the UI loop
pub struct Connection {
    shared: Arc<ConnectionShared>,
    profile: ConnectionProfile,
    store: Arc<dyn Persistence>,
    disconnect_grace: Duration,
    connect_requested: bool,
    selected: Option<usize>,
}

impl Connection {
    /// Builds the connection and restores its persisted subscriptions.
    ///
    /// Unreadable subscription data is reported and treated as an empty list.
    pub fn open(
        record: &ConnectionRecord,
        client: Arc<dyn BrokerClient>,
        bridge: EventBridge,
        store: Arc<dyn Persistence>,
        disconnect_grace: Duration,
    ) -> Self {
        let records = store.load_subscriptions(record.id).unwrap_or_else(|e| {
            warn!("Ignoring stored subscriptions of '{}': {}", record.name, e);
            bridge.report_error(e.into());
            Vec::new()
        });

        let subscriptions: Vec<Arc<Subscription>> = records
            .into_iter()
            .map(|r| Arc::new(Subscription::from_record(record.id, r, bridge.clone())))
            .collect();

        info!(
            "Opened connection '{}' with {} subscriptions",
            record.name,
            subscriptions.len()
        );

        let shared = Arc::new_cyclic(|this| ConnectionShared {
            this: this.clone(),
            id: record.id,
            name: record.name.clone(),
            state: AtomicConnectionState::default(),
            has_connected_once: AtomicBool::new(false),
            subscriptions: RwLock::new(subscriptions),
            client,
            bridge,
        });

        let mut connection = Connection {
            shared,
            profile: record.profile(),
            store,
            disconnect_grace,
            connect_requested: false,
            selected: None,
        };
        connection.select(0);
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    pub fn broker_url(&self) -> String {
        self.profile.target().to_string()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    /// Starts the handshake. Calling it again is a no-op.
    pub fn connect(&mut self) {
        if self.connect_requested {
            debug!("Connect already requested for '{}'", self.profile.name);
            return;
        }
        self.connect_requested = true;

        info!("Connecting '{}' to {}", self.profile.name, self.broker_url());
        let handler: Arc<dyn LifecycleHandler> = self.shared.clone();
        if let Err(e) = self.shared.client.connect(handler) {
            error!("Connect of '{}' failed: {}", self.profile.name, e);
            self.shared.bridge.report_error(CoreError::Connect(e));
        }
    }

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.shared.subscriptions().clone()
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.shared
            .subscriptions()
            .iter()
            .find(|s| s.id() == id)
            .cloned()
    }

    /// Creates a subscription, subscribes it at the broker and persists the list.
    ///
    /// The subscription stays listed when the broker rejects it.
    pub fn subscribe(
        &mut self,
        name: impl Into<String>,
        filter: impl Into<String>,
        qos: Qos,
        format: PayloadFormat,
    ) -> Arc<Subscription> {
        let subscription = Arc::new(Subscription::new(
            self.shared.id,
            name,
            filter,
            qos,
            format,
            self.shared.bridge.clone(),
        ));

        self.shared.subscriptions_mut().push(subscription.clone());
        self.shared.issue_subscribe(&subscription);
        info!(
            "Added subscription '{}' on {}",
            subscription.name(),
            subscription.filter()
        );

        if self.selected.is_none() {
            self.select(0);
        }
        self.persist();
        subscription
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        let removed = {
            let mut subscriptions = self.shared.subscriptions_mut();
            subscriptions
                .iter()
                .position(|s| s.id() == id)
                .map(|index| subscriptions.remove(index))
        };

        let Some(subscription) = removed else {
            warn!("Unsubscribe for unknown subscription {}", id);
            self.shared
                .bridge
                .report_error(CoreError::UnknownSubscription(id));
            return;
        };

        let filter = subscription.filter().to_string();
        info!("Removing subscription '{}' on {}", subscription.name(), filter);
        subscription.set_viewing(false);

        let shared_filter = self
            .shared
            .subscriptions()
            .iter()
            .any(|s| s.filter() == filter);
        if shared_filter {
            debug!("{} still has subscriptions, keeping it at the broker", filter);
        } else {
            let completion = self.shared.client.unsubscribe(&filter);
            watch_completion(completion, &self.shared.bridge, move |source| {
                CoreError::Unsubscribe { filter, source }
            });
        }

        let selected = self.selected.unwrap_or(0);
        self.selected = None;
        self.select(selected);
        self.persist();
    }

    pub fn publish(&self, topic: &str, qos: Qos, retain: bool, payload: Vec<u8>) {
        debug!(
            "Publishing {} bytes to {} ({}, retain={})",
            payload.len(),
            topic,
            qos,
            retain
        );
        let completion = self.shared.client.publish(topic, qos, retain, payload);
        let topic = topic.to_string();
        watch_completion(completion, &self.shared.bridge, move |source| {
            CoreError::Publish { topic, source }
        });
    }

    /// Puts the subscription at `index` (clamped) on screen
    pub fn select(&mut self, index: usize) {
        let subscriptions = self.shared.subscriptions();
        let target = match subscriptions.len() {
            0 => None,
            len => Some(index.min(len - 1)),
        };
        if target == self.selected {
            return;
        }

        for (i, subscription) in subscriptions.iter().enumerate() {
            subscription.set_viewing(Some(i) == target);
        }
        drop(subscriptions);
        self.selected = target;
    }

    pub fn select_next(&mut self) {
        if let Some(index) = self.selected {
            self.select(index + 1);
        }
    }

    pub fn select_previous(&mut self) {
        if let Some(index) = self.selected {
            self.select(index.saturating_sub(1));
        }
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.selected
    }

    pub fn selected(&self) -> Option<Arc<Subscription>> {
        let index = self.selected?;
        self.shared.subscriptions().get(index).cloned()
    }

    pub fn advance_cursor(&self, direction: CursorDirection) {
        if let Some(subscription) = self.selected() {
            subscription.advance_cursor(direction);
        }
    }

    pub fn jump_to_newest(&self) {
        if let Some(subscription) = self.selected() {
            subscription.jump_to_newest();
        }
    }

    fn persist(&self) {
        let records: Vec<SubscriptionRecord> = self
            .shared
            .subscriptions()
            .iter()
            .map(|s| s.record())
            .collect();
        if let Err(e) = self.store.save_subscriptions(self.shared.id, &records) {
            error!("Could not save subscriptions of '{}': {}", self.profile.name, e);
            self.shared.bridge.report_error(e.into());
        }
    }

    /// Closes the broker session after a short grace period and drops the message logs
    pub fn disconnect(self) {
        info!(
            "Disconnecting '{}' (grace {}ms)",
            self.profile.name,
            self.disconnect_grace.as_millis()
        );
        for subscription in self.shared.subscriptions().iter() {
            subscription.clear();
        }
        self.shared.client.disconnect(self.disconnect_grace);
    }
}
