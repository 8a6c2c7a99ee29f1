//! # Operator Front End
//!
//! ## Why This Module Exists
//! Everything the operator sees and types goes through one loop on one task. Broker
//! callbacks never touch the screen; they push events through the bridge and the loop
//! decides what to redraw.
//!
//! ## Key Abstractions
//! - **[`App`]**: the saved connection list and its selection, at most one open
//!   [`Connection`], the error notice and the active form
//! - **Key input**: crossterm's `EventStream`, polled next to the bridge in the same
//!   `tokio::select!`
//! - **[`form::Form`]**: typed input for connections, subscriptions and publishes; keys
//!   edit the current field and Enter submits it
//!
//! ```text
//! EventStream ──keys───┐
//!                      ├─► App::run (tokio::select!) ─► render::draw ─► terminal
//! EventReceiver ─events┘
//! ```

pub mod command;
pub mod form;
pub mod notice;
pub mod render;

use crate::bridge::{EventBridge, EventReceiver, UiEvent};
use crate::config::AppConfig;
use crate::error::CoreError;
use crate::mqtt::client::BrokerClient;
use crate::mqtt::config::ConnectionProfile;
use crate::mqtt::connection::Connection;
use crate::mqtt::subscription::CursorDirection;
use crate::persistence::{ConnectionRecord, Persistence};
use color_eyre::Result;
use command::{ListCommand, ViewCommand};
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use form::{Form, FormStep, FormValues};
use futures::StreamExt;
use notice::ErrorNotice;
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use std::io::Stdout;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

type Screen = Terminal<CrosstermBackend<Stdout>>;

/// Builds the broker client for a connection that is being opened
pub type ClientFactory = Box<dyn Fn(&ConnectionProfile) -> Arc<dyn BrokerClient> + Send>;

/// What the loop should do after handling input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormPurpose {
    NewConnection,
    NewSubscription,
    Publish,
}

pub struct App {
    store: Arc<dyn Persistence>,
    bridge: EventBridge,
    connect: ClientFactory,
    disconnect_grace: Duration,
    records: Vec<ConnectionRecord>,
    selected: usize,
    open: Option<Connection>,
    notice: ErrorNotice,
    form: Option<(FormPurpose, Form)>,
    input: String,
    help: bool,
}

impl App {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn Persistence>,
        bridge: EventBridge,
        connect: ClientFactory,
    ) -> Self {
        let mut notice = ErrorNotice::new(bridge.clone(), config.error_display());
        let records = store.load_connections().unwrap_or_else(|e| {
            error!("Could not load connections: {}", e);
            notice.show(Some(e.into()));
            Vec::new()
        });
        info!("Loaded {} connections", records.len());

        App {
            store,
            bridge,
            connect,
            disconnect_grace: config.disconnect_grace(),
            records,
            selected: 0,
            open: None,
            notice,
            form: None,
            input: String::new(),
            help: false,
        }
    }

    pub fn records(&self) -> &[ConnectionRecord] {
        &self.records
    }

    pub fn open_connection(&self) -> Option<&Connection> {
        self.open.as_ref()
    }

    pub fn notice(&self) -> &ErrorNotice {
        &self.notice
    }

    /// Index of the highlighted connection in the list
    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn form(&self) -> Option<&Form> {
        self.form.as_ref().map(|(_, form)| form)
    }

    /// What has been typed into the current form field so far
    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn help(&self) -> bool {
        self.help
    }

    fn show_error(&mut self, err: CoreError) {
        warn!("{}", err);
        self.notice.show(Some(err));
    }

    /// Applies a bridge event; returns true if the screen needs a redraw
    pub fn handle_event(&mut self, event: UiEvent) -> bool {
        match event {
            UiEvent::StateChanged { connection, state } => {
                let current = self.open.as_ref().is_some_and(|c| c.id() == connection);
                if !current {
                    debug!("Ignoring state {} of closed connection {}", state, connection);
                }
                current
            }
            // the cursor was already adjusted inside ingest, only the screen is stale
            UiEvent::MessageReceived { connection, .. } => {
                self.open.as_ref().is_some_and(|c| c.id() == connection)
            }
            UiEvent::Error(err) => {
                if let Some(err) = &err {
                    warn!("{}", err);
                }
                self.notice.show(err);
                true
            }
            UiEvent::ErrorExpired { generation } => self.notice.expire(generation),
        }
    }

    /// Applies one key press
    pub fn handle_key(&mut self, key: KeyEvent) -> Flow {
        self.help = false;

        if self.form.is_some() {
            return self.form_key(key);
        }

        if self.open.is_some() {
            match ViewCommand::from_key(&key) {
                Some(command) => self.view_command(command),
                None => Flow::Continue,
            }
        } else {
            match ListCommand::from_key(&key) {
                Some(command) => self.list_command(command),
                None => Flow::Continue,
            }
        }
    }

    fn form_key(&mut self, key: KeyEvent) -> Flow {
        match key.code {
            KeyCode::Esc => {
                if let Some((_, form)) = self.form.take() {
                    debug!("{} cancelled", form.title());
                }
                self.input.clear();
            }
            KeyCode::Backspace => {
                self.input.pop();
            }
            KeyCode::Enter => {
                let line = std::mem::take(&mut self.input);
                self.form_line(&line);
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.close();
                return Flow::Quit;
            }
            KeyCode::Char(c) => self.input.push(c),
            _ => {}
        }
        Flow::Continue
    }

    fn form_line(&mut self, line: &str) {
        let Some((purpose, mut form)) = self.form.take() else {
            return;
        };
        match form.input(line) {
            FormStep::Next => self.form = Some((purpose, form)),
            FormStep::Invalid(message) => {
                self.form = Some((purpose, form));
                self.show_error(CoreError::InvalidInput(message));
            }
            FormStep::Done(values) => self.submit(purpose, values),
        }
    }

    fn list_command(&mut self, command: ListCommand) -> Flow {
        match command {
            ListCommand::Add => {
                self.form = Some((FormPurpose::NewConnection, Form::new_connection()))
            }
            ListCommand::Open => self.open(self.selected),
            ListCommand::Remove => self.remove(self.selected),
            ListCommand::Next => {
                self.selected = (self.selected + 1).min(self.records.len().saturating_sub(1))
            }
            ListCommand::Previous => self.selected = self.selected.saturating_sub(1),
            ListCommand::Help => self.help = true,
            ListCommand::Quit => return Flow::Quit,
        }
        Flow::Continue
    }

    fn view_command(&mut self, command: ViewCommand) -> Flow {
        let Some(connection) = self.open.as_mut() else {
            return Flow::Continue;
        };

        match command {
            ViewCommand::Subscribe => {
                self.form = Some((FormPurpose::NewSubscription, Form::new_subscription()))
            }
            ViewCommand::Unsubscribe => match connection.selected() {
                Some(subscription) => connection.unsubscribe(subscription.id()),
                None => self.show_error(CoreError::InvalidInput(
                    "no subscription selected".into(),
                )),
            },
            ViewCommand::Next => connection.select_next(),
            ViewCommand::Previous => connection.select_previous(),
            ViewCommand::Older => connection.advance_cursor(CursorDirection::Older),
            ViewCommand::Newer => connection.advance_cursor(CursorDirection::Newer),
            ViewCommand::Newest => connection.jump_to_newest(),
            ViewCommand::Publish => self.form = Some((FormPurpose::Publish, Form::publish())),
            ViewCommand::Close => self.close(),
            ViewCommand::Help => self.help = true,
            ViewCommand::Quit => {
                self.close();
                return Flow::Quit;
            }
        }
        Flow::Continue
    }

    fn submit(&mut self, purpose: FormPurpose, values: FormValues) {
        let result = match purpose {
            FormPurpose::NewConnection => values
                .connection_record()
                .map(|record| self.add_connection(record)),
            FormPurpose::NewSubscription => values.subscription_request().map(|request| {
                if let Some(connection) = self.open.as_mut() {
                    connection.subscribe(request.name, request.filter, request.qos, request.format);
                }
            }),
            FormPurpose::Publish => values.publish_request().map(|request| {
                if let Some(connection) = self.open.as_ref() {
                    connection.publish(
                        &request.topic,
                        request.qos,
                        request.retain,
                        request.payload,
                    );
                }
            }),
        };
        if let Err(e) = result {
            self.show_error(e);
        }
    }

    fn save_connections(&mut self) {
        if let Err(e) = self.store.save_connections(&self.records) {
            error!("Could not save connections: {}", e);
            self.notice.show(Some(e.into()));
        }
    }

    fn add_connection(&mut self, record: ConnectionRecord) {
        info!("Adding connection '{}' ({})", record.name, record.id);
        self.records.push(record);
        self.save_connections();
    }

    fn remove(&mut self, index: usize) {
        if index >= self.records.len() {
            self.show_error(CoreError::InvalidInput("no connection selected".into()));
            return;
        }
        let record = self.records.remove(index);
        info!("Removing connection '{}'", record.name);
        self.selected = self.selected.min(self.records.len().saturating_sub(1));
        self.save_connections();
        if let Err(e) = self.store.forget_subscriptions(record.id) {
            self.show_error(e.into());
        }
    }

    fn open(&mut self, index: usize) {
        let Some(record) = self.records.get(index) else {
            self.show_error(CoreError::InvalidInput("no connection selected".into()));
            return;
        };

        let client = (self.connect)(&record.profile());
        let mut connection = Connection::open(
            record,
            client,
            self.bridge.clone(),
            self.store.clone(),
            self.disconnect_grace,
        );
        connection.connect();
        self.open = Some(connection);
    }

    fn close(&mut self) {
        if let Some(connection) = self.open.take() {
            connection.disconnect();
        }
    }

    fn draw(&self, terminal: &mut Screen) -> Result<()> {
        terminal.draw(|frame| render::draw(frame, self))?;
        Ok(())
    }

    /// Runs until the operator quits; the terminal is restored on every exit path
    pub async fn run(mut self, mut events: EventReceiver) -> Result<()> {
        enable_raw_mode()?;
        let mut stdout = std::io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

        let result = self.event_loop(&mut terminal, &mut events).await;

        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor()?;
        result?;

        // let a closing connection send its DISCONNECT
        tokio::time::sleep(self.disconnect_grace).await;
        info!("UI loop finished");
        Ok(())
    }

    async fn event_loop(&mut self, terminal: &mut Screen, events: &mut EventReceiver) -> Result<()> {
        let mut keys = EventStream::new();
        self.draw(terminal)?;

        loop {
            let redraw = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("Event bridge closed");
                        break;
                    }
                },
                input = keys.next() => match input {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        if self.handle_key(key) == Flow::Quit {
                            break;
                        }
                        true
                    }
                    Some(Ok(Event::Resize(..))) => true,
                    Some(Ok(_)) => false,
                    Some(Err(e)) => {
                        self.close();
                        return Err(e.into());
                    }
                    None => {
                        info!("Input closed");
                        self.close();
                        break;
                    }
                },
            };
            if redraw {
                self.draw(terminal)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::connection::ConnectionId;
    use crate::mqtt::connection::ConnectionState;
    use crate::mqtt::testing::{Call, FakeBroker};
    use crate::persistence::memory::MemoryStore;

    struct Fixture {
        app: App,
        broker: Arc<FakeBroker>,
        store: Arc<MemoryStore>,
        rx: EventReceiver,
    }

    fn fixture(records: Vec<ConnectionRecord>) -> Fixture {
        let (bridge, rx) = EventBridge::channel();
        let broker = Arc::new(FakeBroker::default());
        let store = Arc::new(MemoryStore::default());
        *store.connections.lock().unwrap() = records;

        let fake = broker.clone();
        let app = App::new(
            &AppConfig::default(),
            store.clone(),
            bridge,
            Box::new(move |_profile: &ConnectionProfile| -> Arc<dyn BrokerClient> {
                fake.clone()
            }),
        );
        Fixture {
            app,
            broker,
            store,
            rx,
        }
    }

    fn local() -> ConnectionRecord {
        ConnectionRecord {
            name: "local".into(),
            broker: "localhost".into(),
            client_id: "deck".into(),
            ..Default::default()
        }
    }

    fn press(app: &mut App, code: KeyCode) -> Flow {
        app.handle_key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    /// Types each line into the open form and submits it with Enter
    fn fill(app: &mut App, lines: &[&str]) {
        for line in lines {
            for c in line.chars() {
                press(app, KeyCode::Char(c));
            }
            press(app, KeyCode::Enter);
        }
    }

    fn screen(app: &App) -> String {
        render::rendered(100, 30, |frame| render::draw(frame, app))
    }

    #[tokio::test]
    async fn add_connection_through_form() {
        let mut f = fixture(Vec::new());
        press(&mut f.app, KeyCode::Char('a'));
        fill(
            &mut f.app,
            &[
                "office", "deck-7", "broker.local", "8883", "", "", "y", "", "", "", "",
            ],
        );
        assert!(f.app.form().is_none());
        assert_eq!(f.app.records().len(), 1);
        let saved = f.store.connections.lock().unwrap().clone();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].port, 8883);
        assert!(saved[0].use_tls);
        assert!(screen(&f.app).contains("office  mqtts://broker.local:8883"));
    }

    #[tokio::test]
    async fn form_keys_edit_the_field() {
        let mut f = fixture(Vec::new());
        press(&mut f.app, KeyCode::Char('a'));
        // bound keys are plain text inside a form
        for c in "qax".chars() {
            assert_eq!(press(&mut f.app, KeyCode::Char(c)), Flow::Continue);
        }
        press(&mut f.app, KeyCode::Backspace);
        assert_eq!(f.app.input(), "qa");
        assert!(screen(&f.app).contains("> qa"));

        press(&mut f.app, KeyCode::Esc);
        assert!(f.app.form().is_none());
        assert_eq!(f.app.input(), "");
        assert!(f.app.records().is_empty());
    }

    #[tokio::test]
    async fn invalid_form_value_is_shown() {
        let mut f = fixture(Vec::new());
        press(&mut f.app, KeyCode::Char('a'));
        fill(&mut f.app, &["x", "", "host", "port?", "", "", "", "", "", "", ""]);
        assert!(f.app.records().is_empty());
        assert!(matches!(
            f.app.notice().current(),
            Some(CoreError::InvalidInput(_))
        ));
        assert!(screen(&f.app).contains("! invalid input"));
    }

    #[tokio::test]
    async fn selection_picks_the_connection_to_open() {
        let mut f = fixture(vec![
            local(),
            ConnectionRecord {
                name: "office".into(),
                ..local()
            },
        ]);
        press(&mut f.app, KeyCode::Char('k'));
        assert_eq!(f.app.selected(), 0);
        press(&mut f.app, KeyCode::Char('j'));
        press(&mut f.app, KeyCode::Down);
        assert_eq!(f.app.selected(), 1);

        press(&mut f.app, KeyCode::Enter);
        let connection = f.app.open_connection().unwrap();
        assert_eq!(connection.profile().name, "office");
    }

    #[tokio::test]
    async fn open_subscribe_and_browse() {
        let mut f = fixture(vec![local()]);
        press(&mut f.app, KeyCode::Enter);
        assert_eq!(f.broker.calls(), vec![Call::Connect]);
        f.broker.handler().on_connect();

        press(&mut f.app, KeyCode::Char('a'));
        fill(&mut f.app, &["temps", "home/+/temp", "1", "json"]);
        let connection = f.app.open_connection().unwrap();
        assert_eq!(connection.subscriptions().len(), 1);
        assert!(f.broker.calls().contains(&Call::Subscribe {
            filter: "home/+/temp".into(),
            qos: crate::mqtt::client::Qos::AtLeastOnce
        }));

        f.broker.deliver("home/kitchen/temp", br#"{"c":21}"#);
        f.broker.deliver("home/attic/temp", b"18");

        let mut redraws = 0;
        while let Some(event) = f.rx.try_recv() {
            if f.app.handle_event(event) {
                redraws += 1;
            }
        }
        assert!(redraws >= 2);
        let shown = screen(&f.app);
        assert!(shown.contains("Message 1/2"));
        assert!(shown.contains("home/attic/temp"));

        press(&mut f.app, KeyCode::Char('l'));
        let shown = screen(&f.app);
        assert!(shown.contains("Message 2/2"));
        assert!(shown.contains("\"c\": 21"));

        press(&mut f.app, KeyCode::Char('g'));
        assert!(screen(&f.app).contains("Message 1/2"));
    }
    #[tokio::test]
    async fn stale_state_change_is_ignored() {
        let mut f = fixture(vec![local()]);
        assert!(!f.app.handle_event(UiEvent::StateChanged {
            connection: ConnectionId::new(),
            state: ConnectionState::Connected,
        }));

        press(&mut f.app, KeyCode::Enter);
        let id = f.app.open_connection().unwrap().id();
        assert!(f.app.handle_event(UiEvent::StateChanged {
            connection: id,
            state: ConnectionState::Connected,
        }));
        assert!(!f.app.handle_event(UiEvent::StateChanged {
            connection: ConnectionId::new(),
            state: ConnectionState::Disconnected,
        }));
    }

    #[tokio::test]
    async fn publish_from_form() {
        let mut f = fixture(vec![local()]);
        press(&mut f.app, KeyCode::Enter);
        press(&mut f.app, KeyCode::Char('p'));
        fill(&mut f.app, &["cmd/light", "0", "n", "on"]);
        assert!(f.broker.calls().contains(&Call::Publish {
            topic: "cmd/light".into(),
            qos: crate::mqtt::client::Qos::AtMostOnce,
            retain: false,
            payload: b"on".to_vec(),
        }));
    }

    #[tokio::test]
    async fn close_and_remove() {
        let mut f = fixture(vec![local()]);
        let id = f.app.records()[0].id;
        f.store
            .subscriptions
            .lock()
            .unwrap()
            .insert(id, Vec::new());

        press(&mut f.app, KeyCode::Enter);
        press(&mut f.app, KeyCode::Esc);
        assert!(f.app.open_connection().is_none());
        assert!(f
            .broker
            .calls()
            .contains(&Call::Disconnect(Duration::from_millis(100))));

        press(&mut f.app, KeyCode::Char('r'));
        assert!(f.app.records().is_empty());
        assert!(f.store.connections.lock().unwrap().is_empty());
        assert!(!f.store.subscriptions.lock().unwrap().contains_key(&id));
    }

    #[tokio::test]
    async fn unbound_keys_and_quit() {
        let mut f = fixture(Vec::new());
        assert_eq!(press(&mut f.app, KeyCode::Char('x')), Flow::Continue);
        assert_eq!(f.app.notice().current(), None);

        assert_eq!(press(&mut f.app, KeyCode::Enter), Flow::Continue);
        assert!(screen(&f.app).contains("no connection selected"));

        press(&mut f.app, KeyCode::Char('?'));
        assert!(screen(&f.app).contains("connect to the selected connection"));
        press(&mut f.app, KeyCode::Char('x'));
        assert!(!screen(&f.app).contains("connect to the selected connection"));

        assert_eq!(press(&mut f.app, KeyCode::Char('q')), Flow::Quit);
        assert_eq!(
            f.app
                .handle_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Flow::Quit
        );
    }

    #[tokio::test]
    async fn error_events_reach_the_notice() {
        let mut f = fixture(Vec::new());
        let err = CoreError::Persistence("disk full".into());
        assert!(f.app.handle_event(UiEvent::Error(Some(err.clone()))));
        assert_eq!(f.app.notice().current(), Some(&err));
        let generation = f.app.notice().generation();
        assert!(f.app.handle_event(UiEvent::ErrorExpired { generation }));
        assert_eq!(f.app.notice().current(), None);
    }
}
