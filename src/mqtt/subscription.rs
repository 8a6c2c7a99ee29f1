//! # Subscription Store
//!
//! One topic filter's message stream: a newest-first log plus the cursor the operator
//! uses to page through it.
//!
//! The log is written by the broker driver task ([`Subscription::ingest`]) and read by
//! the UI loop ([`Subscription::view`], [`Subscription::snapshot`]). Log and cursor sit
//! behind a single mutex so the UI never sees a prepend without the matching cursor
//! shift. The lock is only held for deque operations, never across I/O.

use super::client::Qos;
use super::connection::ConnectionId;
use super::message::{Message, PayloadFormat};
use crate::bridge::{EventBridge, UiEvent};
use crate::persistence::SubscriptionRecord;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        SubscriptionId(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorDirection {
    /// Towards older messages (higher index)
    Older,
    /// Towards the newest message (index 0)
    Newer,
}

/// Consistent read of the cursor and the message under it
#[derive(Debug, Clone)]
pub struct View {
    pub cursor: usize,
    pub total: usize,
    pub message: Option<Arc<Message>>,
}

#[derive(Debug, Default)]
struct MessageLog {
    messages: VecDeque<Arc<Message>>,
    cursor: usize,
    viewing: bool,
}

impl MessageLog {
    fn last_index(&self) -> usize {
        self.messages.len().saturating_sub(1)
    }

    fn prepend(&mut self, message: Arc<Message>) {
        self.messages.push_front(message);
        if self.viewing {
            self.on_message_received_while_viewing();
        }
    }

    /// Keeps the same logical message on screen after a prepend.
    ///
    /// Every message moved one slot older, so a cursor browsing history follows it. A
    /// cursor on the newest message stays there and shows the new arrival.
    fn on_message_received_while_viewing(&mut self) {
        if self.cursor != 0 {
            self.cursor = (self.cursor + 1).min(self.last_index());
        }
    }

    fn advance(&mut self, direction: CursorDirection) {
        self.cursor = match direction {
            CursorDirection::Older => (self.cursor + 1).min(self.last_index()),
            CursorDirection::Newer => self.cursor.saturating_sub(1),
        };
    }
}

/// A subscription and its message log.
///
/// Shared as `Arc<Subscription>` between the owning connection and the ingestion callback
/// registered with the broker client.
pub struct Subscription {
    id: SubscriptionId,
    connection: ConnectionId,
    name: String,
    filter: String,
    qos: Qos,
    format: PayloadFormat,
    log: Mutex<MessageLog>,
    bridge: EventBridge,
}

impl Subscription {
    pub fn new(
        connection: ConnectionId,
        name: impl Into<String>,
        filter: impl Into<String>,
        qos: Qos,
        format: PayloadFormat,
        bridge: EventBridge,
    ) -> Self {
        Subscription {
            id: SubscriptionId::new(),
            connection,
            name: name.into(),
            filter: filter.into(),
            qos,
            format,
            log: Mutex::new(MessageLog::default()),
            bridge,
        }
    }

    pub fn from_record(
        connection: ConnectionId,
        record: SubscriptionRecord,
        bridge: EventBridge,
    ) -> Self {
        Subscription::new(
            connection,
            record.name,
            record.filter,
            record.qos,
            record.format,
            bridge,
        )
    }

    pub fn record(&self) -> SubscriptionRecord {
        SubscriptionRecord {
            name: self.name.clone(),
            filter: self.filter.clone(),
            qos: self.qos,
            format: self.format,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn qos(&self) -> Qos {
        self.qos
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    fn log(&self) -> MutexGuard<'_, MessageLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a message delivered by the broker. Runs on the client's task.
    pub fn ingest(&self, topic: String, payload: Vec<u8>) {
        // rendering can be slow for large payloads, keep it outside the lock
        let message = Arc::new(Message::received(topic, payload, self.format));
        debug!(
            "Subscription {} received {} bytes on {}",
            self.filter,
            message.payload().len(),
            message.topic()
        );

        self.log().prepend(message);

        self.bridge.emit(UiEvent::MessageReceived {
            connection: self.connection,
            subscription: self.id,
        });
    }

    pub fn snapshot(&self) -> Vec<Arc<Message>> {
        self.log().messages.iter().cloned().collect()
    }

    pub fn view(&self) -> View {
        let log = self.log();
        View {
            cursor: log.cursor,
            total: log.messages.len(),
            message: log.messages.get(log.cursor).cloned(),
        }
    }

    pub fn len(&self) -> usize {
        self.log().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cursor(&self) -> usize {
        self.log().cursor
    }

    pub fn advance_cursor(&self, direction: CursorDirection) {
        self.log().advance(direction);
    }

    pub fn jump_to_newest(&self) {
        self.log().cursor = 0;
    }

    /// Marks this subscription as the one on screen.
    ///
    /// While set, every ingest shifts the cursor inside the same critical section as the
    /// prepend. Becoming visible starts at the newest message.
    pub fn set_viewing(&self, viewing: bool) {
        let mut log = self.log();
        if viewing && !log.viewing {
            log.cursor = 0;
        }
        log.viewing = viewing;
    }

    pub fn is_viewing(&self) -> bool {
        self.log().viewing
    }

    pub fn clear(&self) {
        let mut log = self.log();
        log.messages.clear();
        log.cursor = 0;
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("format", &self.format)
            .field("messages", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::EventReceiver;
    use proptest::prelude::*;

    fn store(format: PayloadFormat) -> (Subscription, EventReceiver) {
        let (bridge, rx) = EventBridge::channel();
        let sub = Subscription::new(
            ConnectionId::new(),
            "temps",
            "home/+/temp",
            Qos::AtLeastOnce,
            format,
            bridge,
        );
        (sub, rx)
    }

    fn payloads(sub: &Subscription) -> Vec<Vec<u8>> {
        sub.snapshot().iter().map(|m| m.payload().to_vec()).collect()
    }

    #[test]
    fn ingest_prepends_and_notifies() {
        let (sub, mut rx) = store(PayloadFormat::Raw);
        sub.ingest("home/a/temp".into(), b"1".to_vec());
        sub.ingest("home/b/temp".into(), b"2".to_vec());

        assert_eq!(payloads(&sub), vec![b"2".to_vec(), b"1".to_vec()]);
        assert_eq!(sub.snapshot()[0].topic(), "home/b/temp");

        for _ in 0..2 {
            match rx.try_recv() {
                Some(UiEvent::MessageReceived { subscription, .. }) => {
                    assert_eq!(subscription, sub.id())
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn ingest_applies_format() {
        let (sub, _rx) = store(PayloadFormat::Json);
        sub.ingest("t".into(), b"{\"a\":1}".to_vec());
        sub.ingest("t".into(), b"oops".to_vec());

        let messages = sub.snapshot();
        assert_eq!(messages[0].display(), b"oops");
        assert_eq!(messages[1].display_lossy(), "{\n  \"a\": 1\n}");
    }

    #[test]
    fn empty_store_cursor_moves_are_noops() {
        let (sub, _rx) = store(PayloadFormat::Raw);
        sub.advance_cursor(CursorDirection::Older);
        assert_eq!(sub.cursor(), 0);
        sub.advance_cursor(CursorDirection::Newer);
        assert_eq!(sub.cursor(), 0);
        assert!(sub.view().message.is_none());
        sub.set_viewing(true);
        sub.ingest("t".into(), vec![1]);
        assert_eq!(sub.cursor(), 0);
    }

    #[test]
    fn cursor_is_clamped_both_ways() {
        let (sub, _rx) = store(PayloadFormat::Raw);
        for i in 0..3 {
            sub.ingest("t".into(), vec![i]);
        }
        for _ in 0..5 {
            sub.advance_cursor(CursorDirection::Older);
        }
        assert_eq!(sub.cursor(), 2);
        for _ in 0..5 {
            sub.advance_cursor(CursorDirection::Newer);
        }
        assert_eq!(sub.cursor(), 0);
    }

    #[test]
    fn viewing_cursor_follows_the_same_message() {
        let (sub, _rx) = store(PayloadFormat::Raw);
        sub.set_viewing(true);
        for i in 0..4u8 {
            sub.ingest("t".into(), vec![i]);
        }
        sub.advance_cursor(CursorDirection::Older);
        sub.advance_cursor(CursorDirection::Older);
        let before = sub.view();
        assert_eq!(before.cursor, 2);

        sub.ingest("t".into(), vec![99]);

        let after = sub.view();
        assert_eq!(after.cursor, 3);
        assert_eq!(after.total, 5);
        assert_eq!(after.message, before.message);
    }

    #[test]
    fn newest_view_stays_on_newest() {
        let (sub, _rx) = store(PayloadFormat::Raw);
        sub.set_viewing(true);
        sub.ingest("t".into(), vec![1]);
        sub.ingest("t".into(), vec![2]);

        let view = sub.view();
        assert_eq!(view.cursor, 0);
        assert_eq!(view.message.unwrap().payload(), &[2u8]);
    }

    #[test]
    fn hidden_subscription_cursor_is_not_shifted() {
        let (sub, _rx) = store(PayloadFormat::Raw);
        sub.ingest("t".into(), vec![1]);
        sub.ingest("t".into(), vec![2]);
        sub.advance_cursor(CursorDirection::Older);

        sub.ingest("t".into(), vec![3]);
        assert_eq!(sub.cursor(), 1);

        // coming back into view starts at the newest message
        sub.set_viewing(true);
        assert_eq!(sub.cursor(), 0);
    }

    #[test]
    fn concurrent_ingest_keeps_per_thread_order() {
        let (sub, _rx) = store(PayloadFormat::Raw);
        let sub = Arc::new(sub);
        let workers: Vec<_> = (0..4u8)
            .map(|w| {
                let sub = sub.clone();
                std::thread::spawn(move || {
                    for i in 0..50u8 {
                        sub.ingest(format!("w/{}", w), vec![w, i]);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let messages = sub.snapshot();
        assert_eq!(messages.len(), 200);
        for w in 0..4u8 {
            // newest first, so sequence numbers descend per worker
            let seq: Vec<u8> = messages
                .iter()
                .filter(|m| m.payload()[0] == w)
                .map(|m| m.payload()[1])
                .collect();
            let mut expected: Vec<u8> = (0..50).collect();
            expected.reverse();
            assert_eq!(seq, expected);
        }
    }

    #[test]
    fn clear_resets_log_and_cursor() {
        let (sub, _rx) = store(PayloadFormat::Raw);
        sub.ingest("t".into(), vec![1]);
        sub.ingest("t".into(), vec![2]);
        sub.advance_cursor(CursorDirection::Older);
        sub.clear();
        assert!(sub.is_empty());
        assert_eq!(sub.cursor(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Ingest(u8),
        Older,
        Newer,
        Newest,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => any::<u8>().prop_map(Op::Ingest),
            2 => Just(Op::Older),
            1 => Just(Op::Newer),
            1 => Just(Op::Newest),
        ]
    }

    proptest! {
        #[test]
        fn cursor_invariants_hold(ops in proptest::collection::vec(op(), 0..64), viewing in any::<bool>()) {
            let (sub, _rx) = store(PayloadFormat::Raw);
            sub.set_viewing(viewing);
            let mut ingested: Vec<u8> = Vec::new();

            for op in ops {
                match op {
                    Op::Ingest(b) => {
                        let before = sub.view();
                        sub.ingest("t".into(), vec![b]);
                        ingested.push(b);
                        let after = sub.view();

                        if before.cursor == 0 {
                            prop_assert_eq!(after.cursor, 0);
                        } else if viewing {
                            prop_assert_eq!(after.cursor, before.cursor + 1);
                            prop_assert_eq!(after.message, before.message);
                        }
                    }
                    Op::Older => sub.advance_cursor(CursorDirection::Older),
                    Op::Newer => sub.advance_cursor(CursorDirection::Newer),
                    Op::Newest => sub.jump_to_newest(),
                }

                let len = sub.len();
                prop_assert!(sub.cursor() < len.max(1));
            }

            let newest_first: Vec<u8> = sub.snapshot().iter().map(|m| m.payload()[0]).collect();
            ingested.reverse();
            prop_assert_eq!(newest_first, ingested);
        }
    }
}
