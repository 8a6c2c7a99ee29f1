//! Key bindings of the two screens.
//!
//! Keys that are not bound map to `None` and are ignored. Ctrl+C quits from anywhere.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

/// Commands of the connection list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListCommand {
    Add,
    Open,
    Remove,
    Next,
    Previous,
    Help,
    Quit,
}

/// Commands of an open connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewCommand {
    Subscribe,
    Unsubscribe,
    Next,
    Previous,
    Older,
    Newer,
    Newest,
    Publish,
    Close,
    Help,
    Quit,
}

fn is_interrupt(key: &KeyEvent) -> bool {
    key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c')
}

impl ListCommand {
    pub fn from_key(key: &KeyEvent) -> Option<Self> {
        if is_interrupt(key) {
            return Some(ListCommand::Quit);
        }
        match key.code {
            KeyCode::Char('a') => Some(ListCommand::Add),
            KeyCode::Enter => Some(ListCommand::Open),
            KeyCode::Char('r') | KeyCode::Delete => Some(ListCommand::Remove),
            KeyCode::Char('j') | KeyCode::Down => Some(ListCommand::Next),
            KeyCode::Char('k') | KeyCode::Up => Some(ListCommand::Previous),
            KeyCode::Char('?') => Some(ListCommand::Help),
            KeyCode::Char('q') => Some(ListCommand::Quit),
            _ => None,
        }
    }
}

impl ViewCommand {
    pub fn from_key(key: &KeyEvent) -> Option<Self> {
        if is_interrupt(key) {
            return Some(ViewCommand::Quit);
        }
        match key.code {
            KeyCode::Char('a') => Some(ViewCommand::Subscribe),
            KeyCode::Char('r') | KeyCode::Delete => Some(ViewCommand::Unsubscribe),
            KeyCode::Char('j') | KeyCode::Down => Some(ViewCommand::Next),
            KeyCode::Char('k') | KeyCode::Up => Some(ViewCommand::Previous),
            KeyCode::Char('l') | KeyCode::Right => Some(ViewCommand::Older),
            KeyCode::Char('h') | KeyCode::Left => Some(ViewCommand::Newer),
            KeyCode::Char('g') | KeyCode::Home => Some(ViewCommand::Newest),
            KeyCode::Char('p') => Some(ViewCommand::Publish),
            KeyCode::Esc => Some(ViewCommand::Close),
            KeyCode::Char('?') => Some(ViewCommand::Help),
            KeyCode::Char('q') => Some(ViewCommand::Quit),
            _ => None,
        }
    }
}

pub const LIST_HELP: &str = "\
a        new connection
enter    connect to the selected connection
r        delete the selected connection
j / k    move the selection
q        leave";

pub const VIEW_HELP: &str = "\
a / r      add a subscription / remove the selected one
j / k      choose a subscription
l / h / g  older / newer / newest message
p          publish a message
esc        disconnect and go back
q          leave";

pub const LIST_HINT: &str = "a add  enter open  r remove  j/k move  ? help  q quit";

pub const VIEW_HINT: &str = "a sub  r unsub  j/k select  l/h older/newer  p publish  esc back  ? help";

pub const FORM_HINT: &str = "enter next field  esc cancel";
