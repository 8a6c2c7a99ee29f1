use chrono::{DateTime, Local};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// How a subscription displays the payloads it receives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    #[serde(alias = "none")]
    Raw,
    Json,
}

impl PayloadFormat {
    pub const ALL: [PayloadFormat; 2] = [PayloadFormat::Raw, PayloadFormat::Json];

    pub fn label(&self) -> &'static str {
        match self {
            PayloadFormat::Raw => "raw",
            PayloadFormat::Json => "json",
        }
    }

    /// Returns the transformed payload, or `None` when the payload is shown as-is.
    ///
    /// A payload that fails to transform yields `None` as well, so the raw bytes stay
    /// the displayed content.
    pub fn render(&self, payload: &[u8]) -> Option<Vec<u8>> {
        match self {
            PayloadFormat::Raw => None,
            // validated without building a value, so numbers and duplicate keys stay as sent
            PayloadFormat::Json => match serde_json::from_slice::<IgnoredAny>(payload) {
                Ok(_) => Some(indent_json(payload)),
                Err(e) => {
                    debug!("Payload is not valid JSON, keeping raw bytes: {}", e);
                    None
                }
            },
        }
    }
}

fn newline(out: &mut Vec<u8>, depth: usize) {
    out.push(b'\n');
    out.extend(std::iter::repeat(b' ').take(depth * 2));
}

/// Re-indents valid JSON text by two spaces per level.
///
/// Only whitespace between tokens changes. Empty objects and arrays stay on one line.
fn indent_json(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() * 2);
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut just_opened = false;

    for &b in src {
        if in_string {
            out.push(b);
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        if matches!(b, b' ' | b'\t' | b'\n' | b'\r') {
            continue;
        }

        if just_opened {
            just_opened = false;
            if b == b'}' || b == b']' {
                depth = depth.saturating_sub(1);
                out.push(b);
                continue;
            }
            newline(&mut out, depth);
        }

        match b {
            b'"' => {
                in_string = true;
                out.push(b);
            }
            b'{' | b'[' => {
                out.push(b);
                depth += 1;
                just_opened = true;
            }
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                newline(&mut out, depth);
                out.push(b);
            }
            b',' => {
                out.push(b);
                newline(&mut out, depth);
            }
            b':' => out.extend_from_slice(b": "),
            _ => out.push(b),
        }
    }
    out
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A received message, immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    received_at: DateTime<Local>,
    payload: Vec<u8>,
    rendered: Option<Vec<u8>>,
}

impl Message {
    /// Stamps the message with the current local time and renders it once for `format`
    pub fn received(topic: impl Into<String>, payload: Vec<u8>, format: PayloadFormat) -> Self {
        let rendered = format.render(&payload);
        Message {
            topic: topic.into(),
            received_at: Local::now(),
            payload,
            rendered,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn received_at(&self) -> DateTime<Local> {
        self.received_at
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn rendered(&self) -> Option<&[u8]> {
        self.rendered.as_deref()
    }

    /// Bytes to show: the rendering if there is one, otherwise the raw payload
    pub fn display(&self) -> &[u8] {
        self.rendered.as_deref().unwrap_or(&self.payload)
    }

    pub fn display_lossy(&self) -> String {
        String::from_utf8_lossy(self.display()).into_owned()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}: {}\n{}",
            self.received_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.topic,
            self.display_lossy()
        )
    }
}
