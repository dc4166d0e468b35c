//! # Device Module
//!
//! Field hardware access for the transmitter side of the bridge.
//!
//! A PLC driver handle is not reentrant: every call against one station has to
//! come from the same thread, one at a time. This module hides that constraint
//! behind an async API that any number of tasks can call concurrently.
//!
//! ```text
//! device/
//! ├── driver.rs      - Raw driver contract (status codes) and a simulated PLC
//! ├── serializer.rs  - One worker thread per station, FIFO work queue
//! └── registry.rs    - Station id -> serializer map, create-on-connect
//! ```
//!
//! ```text
//! Publisher ──┐
//!             ├──► DeviceRegistry ──► Serializer(station) ──► [worker thread] ──► PlcDriver
//! Gateway  ───┘                        (mpsc FIFO)              (one call at a time)
//! ```

pub mod driver;
pub mod registry;
pub mod serializer;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use driver::{DriverFactory, PlcDriver, SimulatedPlc};
pub use registry::DeviceRegistry;
pub use serializer::{Serializer, SerializerSettings};

/// Logical PLC station number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(pub u16);

impl StationId {
    const LABEL_PREFIX: &'static str = "plc-";

    /// Topic segment for this station, e.g. `plc-005`.
    pub fn label(&self) -> String {
        format!("{}{:03}", Self::LABEL_PREFIX, self.0)
    }

    /// Parses a `plc-005` style segment. A bare number is accepted as well.
    pub fn from_label(segment: &str) -> Option<Self> {
        let digits = segment.strip_prefix(Self::LABEL_PREFIX).unwrap_or(segment);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(StationId)
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state of one station, owned by its serializer.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Hardware operation kind, used in logs and timeout errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Disconnect,
    ReadBlock,
    WriteBlock,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operation::Connect => write!(f, "connect"),
            Operation::Disconnect => write!(f, "disconnect"),
            Operation::ReadBlock => write!(f, "readBlock"),
            Operation::WriteBlock => write!(f, "writeBlock"),
        }
    }
}

/// A memory location polled by the telemetry publisher.
#[derive(Clone, Debug, PartialEq)]
pub struct MonitoredPoint {
    pub address: String,
    pub description: String,
    /// Last value read; `None` until the first successful read.
    pub last_observed_value: Option<i16>,
}

impl MonitoredPoint {
    pub fn new(address: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            description: description.into(),
            last_observed_value: None,
        }
    }
}

/// A logical unit of field hardware, built from static configuration.
///
/// The live connection state is not stored here; it belongs to the station's
/// [`Serializer`] and is queried through the [`DeviceRegistry`].
#[derive(Clone, Debug)]
pub struct Device {
    pub station: StationId,
    pub site: String,
    pub area: String,
    pub line: String,
    pub description: String,
    pub points: Vec<MonitoredPoint>,
}

/// Errors surfaced by the serializer and the registry
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// No serializer exists for the station; it was never connected
    #[error("Station {0} is not connected or managed")]
    NotManaged(StationId),

    /// The serializer exists but its hardware connection is closed
    #[error("Station {0} is not connected")]
    NotConnected(StationId),

    /// The driver returned a non-zero status code
    #[error("Station {station}: driver reported error code 0x{code:X}")]
    OperationFailed { station: StationId, code: i32 },

    /// The worker did not answer within the operation timeout
    #[error("Station {station}: {operation} timed out")]
    Timeout {
        station: StationId,
        operation: Operation,
    },

    /// The worker thread has stopped and no longer accepts work
    #[error("Station {0}: worker stopped")]
    WorkerStopped(StationId),

    /// The worker thread could not be started
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),
}

impl DeviceError {
    /// True for errors that mean the station link is gone rather than a single
    /// operation being rejected by the hardware.
    pub fn is_connectivity(&self) -> bool {
        !matches!(
            self,
            DeviceError::OperationFailed { .. } | DeviceError::Spawn(_)
        )
    }

    /// Raw driver status code, if this error carries one.
    pub fn driver_code(&self) -> Option<i32> {
        match self {
            DeviceError::OperationFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}
