//! # rumqttc Broker Client
//!
//! [`BrokerClient`] on top of `rumqttc`'s `AsyncClient` and `EventLoop`.
//!
//! ## Why This Module Exists
//! `rumqttc` hands out packet ids only when a request is written to the socket and
//! reports acknowledgements as raw packets. The connection state machine wants a
//! completion per request and a callback per topic filter. This module keeps that
//! bookkeeping in one place:
//!
//! ```text
//!  subscribe/publish ──► outbox ──► forwarder ──► request channel ──► EventLoop ──► Outgoing(pkid)
//!                                       │                                            │
//!                                       └─ queued completion (FIFO per kind) ─ bound ◄┘
//!                                                         │
//!                         SubAck / UnsubAck / PubAck / PubComp(pkid) ──► resolved
//! ```
//!
//! The outbox is unbounded and the forwarder waits for room in rumqttc's bounded request
//! channel. Requests made from inside a lifecycle callback, which runs on the driver task
//! that drains that channel, therefore never fail for lack of capacity.
//!
//! ## Driver
//! One spawned task polls the event loop. It reports the lifecycle to the registered
//! [`LifecycleHandler`], dispatches incoming publishes to every matching route, waits
//! `reconnect_delay` between failed attempts and stops on cancellation or after the
//! DISCONNECT packet went out.
//!
//! Sessions are clean: after a reconnect the state machine re-issues its subscriptions,
//! so acknowledgements of the old session are not waited for.

use super::client::{
    BrokerClient, BrokerTarget, Completion, CompletionSender, LifecycleHandler, MessageHandler,
    Qos,
};
use super::config::{ClientSettings, ConnectionProfile, TlsSettings};
use super::{tls, topic};
use crate::bridge::EventBridge;
use crate::error::{BrokerError, CoreError};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, SubAck, SubscribeReasonCode,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// rumqttc refuses shorter keep-alive intervals
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RequestKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

/// Completions waiting for their packet id, then for their acknowledgement
#[derive(Debug, Default)]
struct Pending {
    queued: HashMap<RequestKind, VecDeque<CompletionSender>>,
    inflight: HashMap<(RequestKind, u16), CompletionSender>,
}

impl Pending {
    fn enqueue(&mut self, kind: RequestKind, sender: CompletionSender) {
        self.queued.entry(kind).or_default().push_back(sender);
    }

    /// The request of `kind` that went out with `pkid`
    fn bind(&mut self, kind: RequestKind, pkid: u16) {
        if self.inflight.contains_key(&(kind, pkid)) {
            debug!("{:?} {} replayed", kind, pkid);
            return;
        }
        let Some(sender) = self.queued.get_mut(&kind).and_then(VecDeque::pop_front) else {
            debug!("{:?} {} was not requested through this client", kind, pkid);
            return;
        };
        // QoS 0 publishes carry packet id 0 and get no acknowledgement
        if kind == RequestKind::Publish && pkid == 0 {
            sender.resolve(Ok(()));
        } else {
            self.inflight.insert((kind, pkid), sender);
        }
    }

    /// Takes back the newest queued completion of `kind` whose request never went out
    fn unqueue(&mut self, kind: RequestKind) -> Option<CompletionSender> {
        self.queued.get_mut(&kind).and_then(VecDeque::pop_back)
    }

    fn resolve(&mut self, kind: RequestKind, pkid: u16, result: Result<(), BrokerError>) {
        match self.inflight.remove(&(kind, pkid)) {
            Some(sender) => sender.resolve(result),
            None => debug!("Acknowledgement for unknown {:?} {}", kind, pkid),
        }
    }

    /// Drops subscribe/unsubscribe acknowledgements of a lost session.
    ///
    /// Subscriptions are re-issued on reconnect and unsubscribed filters died with the
    /// session. Publishes stay inflight, rumqttc replays them with the same packet id.
    fn session_lost(&mut self) {
        let stale: Vec<(RequestKind, u16)> = self
            .inflight
            .keys()
            .filter(|(kind, _)| *kind != RequestKind::Publish)
            .copied()
            .collect();
        for key in stale {
            if let Some(sender) = self.inflight.remove(&key) {
                sender.resolve(Ok(()));
            }
        }
    }
}

fn sub_ack_result(ack: &SubAck) -> Result<(), BrokerError> {
    if ack
        .return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
    {
        return Err(BrokerError::Rejected(format!(
            "subscription refused (packet {})",
            ack.pkid
        )));
    }
    Ok(())
}

/// A request waiting in the outbox
#[derive(Debug)]
enum Request {
    Subscribe {
        filter: String,
        qos: Qos,
    },
    Unsubscribe {
        filter: String,
    },
    Publish {
        topic: String,
        qos: Qos,
        retain: bool,
        payload: Vec<u8>,
    },
}

impl Request {
    fn kind(&self) -> RequestKind {
        match self {
            Request::Subscribe { .. } => RequestKind::Subscribe,
            Request::Unsubscribe { .. } => RequestKind::Unsubscribe,
            Request::Publish { .. } => RequestKind::Publish,
        }
    }

    async fn send(self, client: &AsyncClient) -> Result<(), rumqttc::ClientError> {
        match self {
            Request::Subscribe { filter, qos } => client.subscribe(filter, qos.into()).await,
            Request::Unsubscribe { filter } => client.unsubscribe(filter).await,
            Request::Publish {
                topic,
                qos,
                retain,
                payload,
            } => client.publish(topic, qos.into(), retain, payload).await,
        }
    }
}

type Outbox = mpsc::UnboundedReceiver<(Request, CompletionSender)>;

/// Moves outbox requests into rumqttc one at a time, in order.
///
/// A completion is queued right before its request is handed over, so the per-kind
/// FIFO matches the order in which the event loop emits the packets.
async fn forward_requests(
    client: AsyncClient,
    shared: Arc<Shared>,
    mut outbox: Outbox,
    cancel: CancellationToken,
) {
    loop {
        let (request, sender) = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbox.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };

        let kind = request.kind();
        shared.pending().enqueue(kind, sender);
        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = request.send(&client) => sent,
        };
        if let Err(e) = sent {
            warn!("{:?} request not queued: {}", kind, e);
            if let Some(sender) = shared.pending().unqueue(kind) {
                sender.resolve(Err(BrokerError::Request(e.to_string())));
            }
        }
    }
    debug!("Request forwarder stopped");
}

/// State shared between the request side and the driver task
#[derive(Default)]
struct Shared {
    routes: Mutex<Vec<(String, MessageHandler)>>,
    pending: Mutex<Pending>,
    closing: AtomicBool,
}

impl Shared {
    fn routes(&self) -> MutexGuard<'_, Vec<(String, MessageHandler)>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One handler per filter; subscribing again replaces it
    fn add_route(&self, filter: &str, handler: MessageHandler) {
        let mut routes = self.routes();
        routes.retain(|(existing, _)| existing != filter);
        routes.push((filter.to_string(), handler));
    }

    fn remove_route(&self, filter: &str) {
        self.routes().retain(|(existing, _)| existing != filter);
    }

    fn dispatch(&self, topic_name: &str, payload: &[u8]) {
        let handlers: Vec<MessageHandler> = self
            .routes()
            .iter()
            .filter(|(filter, _)| topic::matches(topic_name, filter))
            .map(|(_, handler)| handler.clone())
            .collect();

        if handlers.is_empty() {
            debug!("No route for message on {}", topic_name);
        }
        for handler in handlers {
            handler(topic_name.to_string(), payload.to_vec());
        }
    }
}

fn client_id(profile: &ConnectionProfile) -> String {
    let id = profile.client_id.trim();
    if id.is_empty() {
        let generated = format!("mqttdeck-{}", &Uuid::new_v4().simple().to_string()[..8]);
        info!("No client id configured for '{}', using {}", profile.name, generated);
        generated
    } else {
        id.to_string()
    }
}

fn mqtt_options(profile: &ConnectionProfile, settings: &ClientSettings) -> MqttOptions {
    let mut options = MqttOptions::new(client_id(profile), profile.host.clone(), profile.port);
    options
        .set_keep_alive(settings.keep_alive.max(MIN_KEEP_ALIVE))
        .set_clean_session(true);
    if let Some(credentials) = &profile.credentials {
        options.set_credentials(credentials.username.clone(), credentials.password.clone());
    }
    options
}

/// Production [`BrokerClient`]
pub struct RumqttClient {
    profile: ConnectionProfile,
    settings: ClientSettings,
    bridge: EventBridge,
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
    outbox_tx: mpsc::UnboundedSender<(Request, CompletionSender)>,
    outbox: Mutex<Option<Outbox>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl RumqttClient {
    /// Prepares the client; nothing touches the network before [`BrokerClient::connect`].
    ///
    /// `bridge` receives TLS configuration problems found at connect time.
    pub fn new(profile: ConnectionProfile, settings: ClientSettings, bridge: EventBridge) -> Self {
        let options = mqtt_options(&profile, &settings);
        let (client, eventloop) = AsyncClient::new(options, settings.request_capacity.max(1));
        let (outbox_tx, outbox) = mpsc::unbounded_channel();
        RumqttClient {
            profile,
            settings,
            bridge,
            client,
            eventloop: Mutex::new(Some(eventloop)),
            outbox_tx,
            outbox: Mutex::new(Some(outbox)),
            shared: Arc::new(Shared::default()),
            cancel: CancellationToken::new(),
        }
    }

    fn completion(&self) -> (CompletionSender, Completion) {
        Completion::channel(Some(self.settings.ack_timeout))
    }

    /// Puts a request into the outbox; it reaches rumqttc once the client is connected
    fn request(&self, request: Request) -> Completion {
        let (sender, completion) = self.completion();
        match self.outbox_tx.send((request, sender)) {
            Ok(()) => completion,
            Err(e) => {
                let (request, _) = e.0;
                warn!("{:?} request after shutdown", request.kind());
                Completion::done(Err(BrokerError::Closed))
            }
        }
    }
}

impl BrokerClient for RumqttClient {
    fn connect(&self, handler: Arc<dyn LifecycleHandler>) -> Result<(), BrokerError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BrokerError::Request(format!("no async runtime: {}", e)))?;
        let eventloop = self
            .eventloop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| BrokerError::Request("client already started".into()))?;
        let outbox = self
            .outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| BrokerError::Request("client already started".into()))?;

        runtime.spawn(forward_requests(
            self.client.clone(),
            self.shared.clone(),
            outbox,
            self.cancel.clone(),
        ));

        let driver = Driver {
            eventloop,
            handler,
            shared: self.shared.clone(),
            bridge: self.bridge.clone(),
            target: self.profile.target(),
            tls: self.profile.tls.clone(),
            reconnect_delay: self.settings.reconnect_delay,
            cancel: self.cancel.clone(),
        };
        runtime.spawn(driver.run());
        Ok(())
    }

    fn disconnect(&self, grace: Duration) {
        self.shared.closing.store(true, Ordering::Release);
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }

        let cancel = self.cancel.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    cancel.cancel();
                });
            }
            Err(_) => cancel.cancel(),
        }
    }

    fn subscribe(&self, filter: &str, qos: Qos, on_message: MessageHandler) -> Completion {
        if !topic::valid_filter(filter) {
            return Completion::done(Err(BrokerError::Request(format!(
                "invalid topic filter '{}'",
                filter
            ))));
        }
        self.shared.add_route(filter, on_message);
        self.request(Request::Subscribe {
            filter: filter.to_string(),
            qos,
        })
    }

    fn unsubscribe(&self, filter: &str) -> Completion {
        self.shared.remove_route(filter);
        self.request(Request::Unsubscribe {
            filter: filter.to_string(),
        })
    }

    fn publish(&self, topic_name: &str, qos: Qos, retain: bool, payload: Vec<u8>) -> Completion {
        if topic_name.is_empty() || topic_name.contains(['+', '#']) {
            return Completion::done(Err(BrokerError::Request(format!(
                "invalid topic '{}'",
                topic_name
            ))));
        }
        self.request(Request::Publish {
            topic: topic_name.to_string(),
            qos,
            retain,
            payload,
        })
    }
}

impl Drop for RumqttClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The event-loop task of one client
struct Driver {
    eventloop: EventLoop,
    handler: Arc<dyn LifecycleHandler>,
    shared: Arc<Shared>,
    bridge: EventBridge,
    target: BrokerTarget,
    tls: Option<TlsSettings>,
    reconnect_delay: Duration,
    cancel: CancellationToken,
}

impl Driver {
    fn apply_transport(&mut self) {
        let plan = tls::transport(self.tls.as_ref());
        for warning in plan.warnings {
            self.bridge.report_error(warning);
        }
        self.eventloop.mqtt_options.set_transport(plan.transport);
    }

    async fn run(mut self) {
        info!("Driver for {} started", self.target);
        self.apply_transport();

        let mut connected = false;
        let mut has_connected = false;

        loop {
            if !connected {
                let requested = self
                    .handler
                    .on_connect_attempt(&self.target, self.tls.clone());
                if requested != self.tls {
                    debug!("TLS settings replaced for {}", self.target);
                    self.tls = requested;
                    self.apply_transport();
                }
            }

            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("Connected to {} ({:?})", self.target, ack.code);
                    connected = true;
                    has_connected = true;
                    self.handler.on_connect();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.shared.dispatch(&publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let result = sub_ack_result(&ack);
                    self.shared
                        .pending()
                        .resolve(RequestKind::Subscribe, ack.pkid, result);
                }
                Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                    self.shared
                        .pending()
                        .resolve(RequestKind::Unsubscribe, ack.pkid, Ok(()));
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    self.shared
                        .pending()
                        .resolve(RequestKind::Publish, ack.pkid, Ok(()));
                }
                Ok(Event::Incoming(Packet::PubComp(ack))) => {
                    self.shared
                        .pending()
                        .resolve(RequestKind::Publish, ack.pkid, Ok(()));
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                    self.shared.pending().bind(RequestKind::Subscribe, pkid);
                }
                Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                    self.shared.pending().bind(RequestKind::Unsubscribe, pkid);
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    self.shared.pending().bind(RequestKind::Publish, pkid);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("Disconnect sent to {}", self.target);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if self.shared.closing.load(Ordering::Acquire) {
                        debug!("Connection to {} closed: {}", self.target, e);
                        break;
                    }

                    if connected {
                        connected = false;
                        self.shared.pending().session_lost();
                        self.handler
                            .on_connection_lost(BrokerError::Connection(e.to_string()));
                    } else {
                        // every failed attempt is shown; the notice keeps only the latest
                        warn!("Connecting to {} failed: {}", self.target, e);
                        self.bridge.report_error(CoreError::Connect(BrokerError::Connection(
                            e.to_string(),
                        )));
                    }

                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                    if has_connected {
                        self.handler.on_reconnecting();
                    }
                }
            }
        }

        info!("Driver for {} stopped", self.target);
    }
}
