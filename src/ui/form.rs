//! Forms built from typed field descriptors.
//!
//! A [`Form`] takes one field per submitted line. Text is taken verbatim, toggles take
//! `y`/`n`, choices take an index or a label, and an empty line keeps the shown default.
//! Cancelling is up to the caller, which simply drops the form.

use crate::error::CoreError;
use crate::mqtt::client::Qos;
use crate::mqtt::message::PayloadFormat;
use crate::mqtt::topic;
use crate::persistence::ConnectionRecord;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Text { value: String },
    Toggle { value: bool },
    Choice { options: Vec<String>, index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub label: &'static str,
    pub kind: FieldKind,
}

impl Field {
    pub fn text(label: &'static str, default: &str) -> Self {
        Field {
            label,
            kind: FieldKind::Text {
                value: default.to_string(),
            },
        }
    }

    pub fn toggle(label: &'static str, default: bool) -> Self {
        Field {
            label,
            kind: FieldKind::Toggle { value: default },
        }
    }

    pub fn choice<I, S>(label: &'static str, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Field {
            label,
            kind: FieldKind::Choice {
                options: options.into_iter().map(Into::into).collect(),
                index: 0,
            },
        }
    }

    /// Applies one input line; `Err` carries a message for the operator
    fn fill(&mut self, line: &str) -> Result<(), String> {
        let input = line.trim();
        match &mut self.kind {
            FieldKind::Text { value } => {
                if !input.is_empty() {
                    *value = line.trim_end_matches(['\r', '\n']).to_string();
                }
                Ok(())
            }
            FieldKind::Toggle { value } => {
                match input.to_ascii_lowercase().as_str() {
                    "" => {}
                    "y" | "yes" | "true" | "1" => *value = true,
                    "n" | "no" | "false" | "0" => *value = false,
                    other => return Err(format!("'{}' is not y or n", other)),
                }
                Ok(())
            }
            FieldKind::Choice { options, index } => {
                if input.is_empty() {
                    return Ok(());
                }
                if let Ok(n) = input.parse::<usize>() {
                    if n < options.len() {
                        *index = n;
                        return Ok(());
                    }
                    return Err(format!("choose 0 to {}", options.len().saturating_sub(1)));
                }
                match options.iter().position(|o| o.eq_ignore_ascii_case(input)) {
                    Some(found) => {
                        *index = found;
                        Ok(())
                    }
                    None => Err(format!("'{}' is not one of the choices", input)),
                }
            }
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            FieldKind::Text { value } if value.is_empty() => write!(f, "{}", self.label),
            FieldKind::Text { value } => write!(f, "{} [{}]", self.label, value),
            FieldKind::Toggle { value } => {
                write!(f, "{} (y/n) [{}]", self.label, if *value { "y" } else { "n" })
            }
            FieldKind::Choice { options, index } => {
                write!(f, "{}", self.label)?;
                for (i, option) in options.iter().enumerate() {
                    let marker = if i == *index { "*" } else { " " };
                    write!(f, "\n  {}{}: {}", marker, i, option)?;
                }
                Ok(())
            }
        }
    }
}

/// Result of feeding a line to a [`Form`]
#[derive(Debug, PartialEq)]
pub enum FormStep {
    Next,
    Invalid(String),
    Done(FormValues),
}

#[derive(Debug, Clone)]
pub struct Form {
    title: &'static str,
    fields: Vec<Field>,
    current: usize,
}

impl Form {
    pub fn new(title: &'static str, fields: Vec<Field>) -> Self {
        Form {
            title,
            fields,
            current: 0,
        }
    }

    pub fn new_connection() -> Self {
        Form::new(
            "New connection",
            vec![
                Field::text("Name", ""),
                Field::text("Client id", ""),
                Field::text("Broker", ""),
                Field::text("Port", "1883"),
                Field::text("Username", ""),
                Field::text("Password", ""),
                Field::toggle("Use TLS", false),
                Field::toggle("Authenticate", true),
                Field::text("Key file", ""),
                Field::text("Cert file", ""),
                Field::text("CA file", ""),
            ],
        )
    }

    pub fn new_subscription() -> Self {
        Form::new(
            "New subscription",
            vec![
                Field::text("Name", ""),
                Field::text("Topic", ""),
                Field::choice("QoS", Qos::ALL.iter().map(Qos::label)),
                Field::choice("Format", PayloadFormat::ALL.iter().map(PayloadFormat::label)),
            ],
        )
    }

    pub fn publish() -> Self {
        Form::new(
            "Publish",
            vec![
                Field::text("Topic", ""),
                Field::choice("QoS", Qos::ALL.iter().map(Qos::label)),
                Field::toggle("Retain", false),
                Field::text("Message", ""),
            ],
        )
    }

    pub fn title(&self) -> &str {
        self.title
    }

    pub fn current_field(&self) -> Option<&Field> {
        self.fields.get(self.current)
    }

    pub fn progress(&self) -> (usize, usize) {
        (self.current + 1, self.fields.len())
    }

    pub fn input(&mut self, line: &str) -> FormStep {
        let Some(field) = self.fields.get_mut(self.current) else {
            return FormStep::Done(FormValues::from_fields(&self.fields));
        };
        if let Err(message) = field.fill(line) {
            return FormStep::Invalid(format!("{}: {}", field.label, message));
        }

        self.current += 1;
        if self.current >= self.fields.len() {
            FormStep::Done(FormValues::from_fields(&self.fields))
        } else {
            FormStep::Next
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldValue {
    Text(String),
    Toggle(bool),
    Choice(usize),
}

/// The filled-in values of a finished form, looked up by field label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormValues(Vec<(&'static str, FieldValue)>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub name: String,
    pub filter: String,
    pub qos: Qos,
    pub format: PayloadFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub qos: Qos,
    pub retain: bool,
    pub payload: Vec<u8>,
}

fn invalid(message: impl Into<String>) -> CoreError {
    CoreError::InvalidInput(message.into())
}

impl FormValues {
    fn from_fields(fields: &[Field]) -> Self {
        FormValues(
            fields
                .iter()
                .map(|field| {
                    let value = match &field.kind {
                        FieldKind::Text { value } => FieldValue::Text(value.clone()),
                        FieldKind::Toggle { value } => FieldValue::Toggle(*value),
                        FieldKind::Choice { index, .. } => FieldValue::Choice(*index),
                    };
                    (field.label, value)
                })
                .collect(),
        )
    }

    fn get(&self, label: &str) -> Option<&FieldValue> {
        self.0.iter().find(|(l, _)| *l == label).map(|(_, v)| v)
    }

    pub fn text(&self, label: &str) -> &str {
        match self.get(label) {
            Some(FieldValue::Text(value)) => value,
            _ => "",
        }
    }

    pub fn toggle(&self, label: &str) -> bool {
        matches!(self.get(label), Some(FieldValue::Toggle(true)))
    }

    pub fn choice(&self, label: &str) -> usize {
        match self.get(label) {
            Some(FieldValue::Choice(index)) => *index,
            _ => 0,
        }
    }

    fn required(&self, label: &str) -> Result<String, CoreError> {
        let value = self.text(label).trim();
        if value.is_empty() {
            return Err(invalid(format!("{} is required", label)));
        }
        Ok(value.to_string())
    }

    fn qos(&self) -> Result<Qos, CoreError> {
        let index = self.choice("QoS");
        u8::try_from(index)
            .ok()
            .and_then(|n| Qos::try_from(n).ok())
            .ok_or_else(|| invalid(format!("QoS {} out of range", index)))
    }

    pub fn connection_record(&self) -> Result<ConnectionRecord, CoreError> {
        let name = self.required("Name")?;
        let broker = self.required("Broker")?;
        let port_text = self.required("Port")?;
        let port = match port_text.parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => return Err(invalid(format!("'{}' is not a valid port", port_text))),
        };

        Ok(ConnectionRecord {
            name,
            broker,
            port,
            client_id: self.text("Client id").trim().to_string(),
            username: self.text("Username").to_string(),
            password: self.text("Password").to_string(),
            use_tls: self.toggle("Use TLS"),
            authenticate: self.toggle("Authenticate"),
            key_file: self.text("Key file").trim().to_string(),
            cert_file: self.text("Cert file").trim().to_string(),
            ca_file: self.text("CA file").trim().to_string(),
            ..Default::default()
        })
    }

    pub fn subscription_request(&self) -> Result<SubscriptionRequest, CoreError> {
        let filter = self.required("Topic")?;
        if !topic::valid_filter(&filter) {
            return Err(invalid(format!("'{}' is not a valid topic filter", filter)));
        }
        let name = match self.text("Name").trim() {
            "" => filter.clone(),
            name => name.to_string(),
        };
        let format = PayloadFormat::ALL
            .get(self.choice("Format"))
            .copied()
            .unwrap_or_default();

        Ok(SubscriptionRequest {
            name,
            filter,
            qos: self.qos()?,
            format,
        })
    }

    pub fn publish_request(&self) -> Result<PublishRequest, CoreError> {
        let topic = self.required("Topic")?;
        if topic.contains(['+', '#']) {
            return Err(invalid("wildcards are not allowed when publishing"));
        }
        Ok(PublishRequest {
            topic,
            qos: self.qos()?,
            retain: self.toggle("Retain"),
            payload: self.text("Message").as_bytes().to_vec(),
        })
    }
}
