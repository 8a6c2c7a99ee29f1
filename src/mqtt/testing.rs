//! In-process brokers for tests.
//!
//! [`FakeBroker`] is a [`BrokerClient`] that records every request, keeps the registered
//! lifecycle handler so tests can fire the callbacks by hand, and routes
//! [`FakeBroker::deliver`]ed messages through the filters the way a broker would.
//!
//! [`MiniBroker`] is a TCP listener that speaks just enough MQTT 3.1.1 to accept one
//! client at a time and acknowledge what it sends, for tests that drive the real
//! rumqttc client.

use super::client::{BrokerClient, Completion, LifecycleHandler, MessageHandler, Qos};
use super::topic;
use crate::error::BrokerError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect,
    Disconnect(Duration),
    Subscribe {
        filter: String,
        qos: Qos,
    },
    Unsubscribe(String),
    Publish {
        topic: String,
        qos: Qos,
        retain: bool,
        payload: Vec<u8>,
    },
}

#[derive(Default)]
pub struct FakeBroker {
    calls: Mutex<Vec<Call>>,
    handler: Mutex<Option<Arc<dyn LifecycleHandler>>>,
    routes: Mutex<Vec<(String, MessageHandler)>>,
    connect_error: Mutex<Option<BrokerError>>,
    operation_error: Mutex<Option<BrokerError>>,
}

impl FakeBroker {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// The handler registered by the last `connect`
    pub fn handler(&self) -> Arc<dyn LifecycleHandler> {
        self.handler
            .lock()
            .unwrap()
            .clone()
            .expect("connect was never called")
    }

    pub fn fail_connect(&self, err: BrokerError) {
        *self.connect_error.lock().unwrap() = Some(err);
    }

    /// Every following subscribe, unsubscribe and publish completes with `err`
    pub fn fail_operations(&self, err: BrokerError) {
        *self.operation_error.lock().unwrap() = Some(err);
    }

    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        let routes: Vec<MessageHandler> = self
            .routes
            .lock()
            .unwrap()
            .iter()
            .filter(|(filter, _)| topic::matches(topic, filter))
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in routes {
            handler(topic.to_string(), payload.to_vec());
        }
    }

    fn record(&self, call: Call) -> Completion {
        self.calls.lock().unwrap().push(call);
        match self.operation_error.lock().unwrap().clone() {
            Some(err) => Completion::done(Err(err)),
            None => Completion::done(Ok(())),
        }
    }
}

impl BrokerClient for FakeBroker {
    fn connect(&self, handler: Arc<dyn LifecycleHandler>) -> Result<(), BrokerError> {
        self.calls.lock().unwrap().push(Call::Connect);
        if let Some(err) = self.connect_error.lock().unwrap().clone() {
            return Err(err);
        }
        *self.handler.lock().unwrap() = Some(handler);
        Ok(())
    }

    fn disconnect(&self, grace: Duration) {
        self.calls.lock().unwrap().push(Call::Disconnect(grace));
    }

    fn subscribe(&self, filter: &str, qos: Qos, on_message: MessageHandler) -> Completion {
        {
            let mut routes = self.routes.lock().unwrap();
            routes.retain(|(existing, _)| existing != filter);
            routes.push((filter.to_string(), on_message));
        }
        self.record(Call::Subscribe {
            filter: filter.to_string(),
            qos,
        })
    }

    fn unsubscribe(&self, filter: &str) -> Completion {
        self.routes
            .lock()
            .unwrap()
            .retain(|(existing, _)| existing != filter);
        self.record(Call::Unsubscribe(filter.to_string()))
    }

    fn publish(&self, topic: &str, qos: Qos, retain: bool, payload: Vec<u8>) -> Completion {
        self.record(Call::Publish {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        })
    }
}

pub struct MiniBroker {
    port: u16,
    subscribed: Arc<Mutex<Vec<String>>>,
    task: tokio::task::JoinHandle<()>,
}

impl MiniBroker {
    pub async fn start() -> MiniBroker {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let subscribed = Arc::new(Mutex::new(Vec::new()));
        let seen = subscribed.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                // a closed session just waits for the next client
                let _ = serve(stream, &seen).await;
            }
        });
        MiniBroker {
            port,
            subscribed,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Every filter seen in a SUBSCRIBE, in arrival order
    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }
}

impl Drop for MiniBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;
    let mut length = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        length |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; length];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}

fn read_str(body: &[u8], at: &mut usize) -> String {
    let len = u16::from_be_bytes([body[*at], body[*at + 1]]) as usize;
    let text = String::from_utf8_lossy(&body[*at + 2..*at + 2 + len]).into_owned();
    *at += 2 + len;
    text
}

async fn serve(mut stream: TcpStream, subscribed: &Mutex<Vec<String>>) -> std::io::Result<()> {
    loop {
        let (header, body) = read_packet(&mut stream).await?;
        let reply = match header >> 4 {
            // CONNECT
            1 => vec![0x20, 2, 0, 0],
            // PUBLISH
            3 => {
                let mut at = 0;
                read_str(&body, &mut at);
                match (header >> 1) & 0x03 {
                    0 => continue,
                    1 => vec![0x40, 2, body[at], body[at + 1]],
                    _ => vec![0x50, 2, body[at], body[at + 1]],
                }
            }
            // PUBREL
            6 => vec![0x70, 2, body[0], body[1]],
            // SUBSCRIBE
            8 => {
                let mut at = 2;
                let mut granted = Vec::new();
                while at < body.len() {
                    let filter = read_str(&body, &mut at);
                    granted.push(body[at]);
                    at += 1;
                    subscribed.lock().unwrap().push(filter);
                }
                let mut reply = vec![0x90, 2 + granted.len() as u8, body[0], body[1]];
                reply.extend(granted);
                reply
            }
            // UNSUBSCRIBE
            10 => vec![0xb0, 2, body[0], body[1]],
            // PINGREQ
            12 => vec![0xd0, 0],
            // DISCONNECT
            14 => return Ok(()),
            _ => continue,
        };
        stream.write_all(&reply).await?;
    }
}
