//! # MQTT Integration Module
//!
//! Bus plumbing shared by the transmitter and the server. Everything that
//! crosses the broker is described here: the topic grammar, the payload
//! records, and the client abstraction both processes talk through.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs   - Broker connection settings
//! ├── message.rs  - BusMessage, the unit the router consumes
//! ├── topic.rs    - dt/status/cmd topic grammar, parse and build
//! ├── payload.rs  - One strict record type per message category
//! ├── client.rs   - BusClient trait and the rumqttc-backed MqttBus
//! └── memory.rs   - In-process broker for loopback runs and tests
//! ```
//!
//! ## Wire Contract
//!
//! | Purpose   | Topic                                                | Payload                          |
//! |-----------|------------------------------------------------------|----------------------------------|
//! | Telemetry | `dt/{site}/{area}/{line}/plc-{station}/{address}`    | `{"value": n, "timestamp": ...}` |
//! | Status    | `status/{site}/{area}/{line}/{emitter}/connection`   | `{"state": "online"}` (retained) |
//! | Command   | `cmd/{site}/{area}/{line}/plc-{station}/write/{addr}`| `{"value": n}`                   |
//!
//! Station segments are zero padded to three digits (`plc-005`).
//!
//! ## Connection Handling
//!
//! Reconnection and retry belong to the client; the rest of the crate only
//! sees `publish`, `subscribe`, `disconnect` and a stream of inbound
//! [`message::BusMessage`]s.

pub mod client;
pub mod config;
pub mod memory;
pub mod message;
pub mod payload;
pub mod topic;

pub use client::{BusClient, BusError, MqttBus};
pub use config::MqttConfig;
pub use memory::MemoryBus;
pub use message::BusMessage;
