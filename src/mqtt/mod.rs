//! # MQTT Integration Module
//!
//! Broker sessions, subscriptions and the message logs the operator browses.
//!
//! ## Why This Module Exists
//!
//! The broker client delivers lifecycle changes and messages on its own task, at any
//! time, while the operator is reading or scrolling through the very same data. This
//! module turns those asynchronous callbacks into state the UI loop can read without
//! races:
//! - Connection lifecycle tracked as an atomic state, reported through the event bridge
//! - Subscriptions re-applied on every (re)connect
//! - Per-subscription message logs with a cursor that keeps its message on screen while
//!   new ones arrive
//! - Publishing with asynchronous success/failure reporting
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── client.rs         - BrokerClient / LifecycleHandler capability traits, QoS, completions
//! ├── config.rs         - Connection profiles and client tuning
//! ├── connection.rs     - Connection state machine
//! ├── message.rs        - Received messages and payload formats
//! ├── rumqtt_client.rs  - BrokerClient implementation on rumqttc
//! ├── subscription.rs   - Subscription store: message log and viewing cursor
//! ├── tls.rs            - TLS transport construction
//! └── topic.rs          - Topic filter validation and matching
//! ```
//!
//! ## Design Philosophy
//!
//! - **Library behind a trait**: the state machine only sees [`client::BrokerClient`],
//!   tests drive it with an in-process fake
//! - **Short critical sections**: one mutex per message log, held for a deque operation
//!   and never across I/O or `.await`
//! - **Errors are data**: failed operations become events, the local model is never
//!   rolled back

pub mod client;
pub mod config;
pub mod connection;
pub mod message;
pub mod rumqtt_client;
pub mod subscription;
pub mod tls;
pub mod topic;

#[cfg(test)]
pub(crate) mod testing;
