//! PLC to MQTT to document-store bridge.
//!
//! The `transmitter` side polls PLC stations and publishes their memory as
//! telemetry; the `server` side mirrors telemetry and presence into a
//! document store and relays queued write commands back over the bus.

pub mod app;
pub mod config;
pub mod device;
pub mod mqtt;
pub mod routing;
pub mod store;
pub mod telemetry;
