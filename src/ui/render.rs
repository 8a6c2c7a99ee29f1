//! Draws the UI state with ratatui widgets.
//!
//! ```text
//! ┌ main ─────────────────────────────────┐  connection list, or
//! │                                       │  subscriptions │ message
//! └───────────────────────────────────────┘
//! ! latest error
//! ┌ form / help ──────────────────────────┐  key hints when idle
//! ```

use super::command::{FORM_HINT, LIST_HELP, LIST_HINT, VIEW_HELP, VIEW_HINT};
use super::form::Form;
use super::App;
use crate::mqtt::connection::{Connection, ConnectionState};
use crate::persistence::ConnectionRecord;
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
    Frame,
};

const NOTICE_HEIGHT: u16 = 1;
const SUBSCRIPTIONS_PERCENT: u16 = 40;

fn highlight() -> Style {
    Style::default()
        .fg(Color::Yellow)
        .add_modifier(Modifier::BOLD)
}

/// Renders the whole screen
pub fn draw(frame: &mut Frame, app: &App) {
    let bottom = bottom_lines(app);
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(3),
            Constraint::Length(NOTICE_HEIGHT),
            Constraint::Length(bottom.len() as u16 + 2),
        ])
        .split(frame.area());
    let [main_area, notice_area, bottom_area] = chunks.as_ref() else {
        return;
    };

    match app.open_connection() {
        Some(connection) => connection_view(frame, *main_area, connection),
        None => connection_list(frame, *main_area, app.records(), app.selected()),
    }

    if let Some(err) = app.notice().current() {
        let notice = Paragraph::new(format!("! {}", err)).style(Style::default().fg(Color::Red));
        frame.render_widget(notice, *notice_area);
    }

    let title = match app.form() {
        Some(form) => form_title(form),
        None if app.help() => " Keys ".to_string(),
        None => String::new(),
    };
    let bottom = Paragraph::new(bottom)
        .block(Block::default().borders(Borders::ALL).title(title))
        .wrap(Wrap { trim: false });
    frame.render_widget(bottom, *bottom_area);
}

fn bottom_lines(app: &App) -> Vec<Line<'static>> {
    if let Some(form) = app.form() {
        return form_lines(form, app.input());
    }
    let connected = app.open_connection().is_some();
    let text = match (app.help(), connected) {
        (true, true) => VIEW_HELP,
        (true, false) => LIST_HELP,
        (false, true) => VIEW_HINT,
        (false, false) => LIST_HINT,
    };
    text.lines().map(|line| Line::from(line.to_string())).collect()
}

fn form_title(form: &Form) -> String {
    let (step, total) = form.progress();
    format!(" {} ({}/{}) ", form.title(), step, total)
}

fn form_lines(form: &Form, input: &str) -> Vec<Line<'static>> {
    let mut lines: Vec<Line> = match form.current_field() {
        Some(field) => field
            .to_string()
            .lines()
            .map(|line| Line::from(line.to_string()))
            .collect(),
        None => Vec::new(),
    };
    lines.push(Line::from(vec![
        Span::styled("> ", highlight()),
        Span::raw(input.to_string()),
    ]));
    lines.push(Line::from(Span::styled(
        FORM_HINT,
        Style::default().fg(Color::DarkGray),
    )));
    lines
}

fn connection_list(frame: &mut Frame, area: Rect, records: &[ConnectionRecord], selected: usize) {
    let block = Block::default().borders(Borders::ALL).title(" Connections ");
    if records.is_empty() {
        let empty = Paragraph::new("(none, press 'a')").block(block);
        frame.render_widget(empty, area);
        return;
    }

    let items: Vec<ListItem> = records
        .iter()
        .map(|record| {
            let scheme = if record.use_tls { "mqtts" } else { "mqtt" };
            ListItem::new(Line::from(vec![
                Span::styled(record.name.clone(), Style::default().add_modifier(Modifier::BOLD)),
                Span::raw(format!(
                    "  {}://{}:{}",
                    scheme, record.broker, record.port
                )),
            ]))
        })
        .collect();

    let list = List::new(items)
        .block(block)
        .highlight_style(highlight())
        .highlight_symbol("> ");
    let mut state = ListState::default();
    state.select(Some(selected));
    frame.render_stateful_widget(list, area, &mut state);
}

fn state_marker(state: ConnectionState) -> (&'static str, Color) {
    match state {
        ConnectionState::Connected => ("●", Color::Green),
        ConnectionState::Connecting | ConnectionState::Reconnecting => ("…", Color::Yellow),
        ConnectionState::Disconnected => ("○", Color::Red),
    }
}

fn connection_view(frame: &mut Frame, area: Rect, connection: &Connection) {
    let state = connection.state();
    let (marker, color) = state_marker(state);
    let title = Line::from(vec![
        Span::raw(" "),
        Span::styled(marker, Style::default().fg(color)),
        Span::raw(format!(
            " {}  {}  [{}] ",
            connection.profile().name,
            connection.broker_url(),
            state
        )),
    ]);
    let outer = Block::default().borders(Borders::ALL).title(title);
    let inner = outer.inner(area);
    frame.render_widget(outer, area);

    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(SUBSCRIPTIONS_PERCENT),
            Constraint::Min(10),
        ])
        .split(inner);
    let [subscriptions_area, message_area] = chunks.as_ref() else {
        return;
    };
    subscription_list(frame, *subscriptions_area, connection);
    message_pane(frame, *message_area, connection);
}

fn subscription_list(frame: &mut Frame, area: Rect, connection: &Connection) {
    let block = Block::default().borders(Borders::ALL).title(" Subscriptions ");
    let selected = connection.selected_index();
    let subscriptions = connection.subscriptions();
    if subscriptions.is_empty() {
        frame.render_widget(Paragraph::new("(none, press 'a')").block(block), area);
        return;
    }

    let items: Vec<ListItem> = subscriptions
        .iter()
        .map(|subscription| {
            ListItem::new(vec![
                Line::from(subscription.name().to_string()),
                Line::from(Span::styled(
                    format!(
                        "  {}  qos {}  {} msgs",
                        subscription.filter(),
                        subscription.qos() as u8,
                        subscription.len()
                    ),
                    Style::default().fg(Color::DarkGray),
                )),
            ])
        })
        .collect();
    let list = List::new(items)
        .block(block)
        .highlight_style(highlight())
        .highlight_symbol("> ");
    let mut state = ListState::default();
    state.select(selected);
    frame.render_stateful_widget(list, area, &mut state);
}

fn message_pane(frame: &mut Frame, area: Rect, connection: &Connection) {
    let Some(subscription) = connection.selected() else {
        let block = Block::default().borders(Borders::ALL).title(" Message ");
        frame.render_widget(block, area);
        return;
    };

    let view = subscription.view();
    let (title, body) = match view.message {
        None => (
            " Message ".to_string(),
            format!("No messages on {} yet", subscription.filter()),
        ),
        Some(message) => (
            format!(" Message {}/{} ", view.cursor + 1, view.total),
            format!(
                "{}  {}\n\n{}",
                message.received_at().format("%Y-%m-%d %H:%M:%S"),
                message.topic(),
                message.display_lossy()
            ),
        ),
    };
    let pane = Paragraph::new(body)
        .block(Block::default().borders(Borders::ALL).title(title))
        .wrap(Wrap { trim: false });
    frame.render_widget(pane, area);
}

/// Draws with `render` on a test terminal and returns the rows as plain text
#[cfg(test)]
pub fn rendered(width: u16, height: u16, render: impl FnOnce(&mut Frame)) -> String {
    use ratatui::{backend::TestBackend, Terminal};

    let mut terminal = Terminal::new(TestBackend::new(width, height)).unwrap();
    terminal.draw(render).unwrap();
    let buffer = terminal.backend().buffer();
    buffer
        .content()
        .chunks(width as usize)
        .map(|row| row.iter().map(|cell| cell.symbol()).collect::<String>())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_marks_selection() {
        let records = vec![
            ConnectionRecord {
                name: "local".into(),
                broker: "localhost".into(),
                ..Default::default()
            },
            ConnectionRecord {
                name: "office".into(),
                broker: "broker.local".into(),
                port: 8883,
                use_tls: true,
                ..Default::default()
            },
        ];
        let text = rendered(60, 6, |frame| {
            let area = frame.area();
            connection_list(frame, area, &records, 1)
        });
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[1].contains("local  mqtt://localhost:1883"));
        assert!(!lines[1].contains("> "));
        assert!(lines[2].contains("> office  mqtts://broker.local:8883"));

        let empty = rendered(60, 4, |frame| {
            let area = frame.area();
            connection_list(frame, area, &[], 0)
        });
        assert!(empty.contains("press 'a'"));
    }

    #[test]
    fn form_shows_field_and_typed_text() {
        let form = Form::publish();
        let lines: Vec<String> = form_lines(&form, "cmd/li")
            .iter()
            .map(|line| line.to_string())
            .collect();
        assert_eq!(lines, vec!["Topic", "> cmd/li", FORM_HINT]);
        assert_eq!(form_title(&form), " Publish (1/4) ");
    }
}
