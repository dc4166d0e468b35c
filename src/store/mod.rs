//! # Store Module
//!
//! Boundary to the cloud document store on the server side.
//!
//! The store is addressed by `collection/document` paths. Updates are
//! partial-document patches applied with merge semantics: a patch key may use
//! dots (`devices.D1000`) to reach into nested maps, and fields the patch does
//! not name are left alone.
//!
//! ```text
//! store/
//! ├── memory.rs  - MemoryStore, in-process store with optional JSON snapshot
//! ├── sync.rs    - Telemetry/status -> StoreUpdate, batched writer
//! └── relay.rs   - Command queue -> cmd/... bus topic
//! ```
//!
//! The command queue collection is an upstream feed only: the relay turns each
//! pending command into a bus command, and the transmitter's gateway is the
//! only component that writes to hardware.

pub mod memory;
pub mod relay;
pub mod sync;

use crate::device::StationId;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tokio::sync::mpsc;

pub use memory::MemoryStore;
pub use relay::CommandRelay;
pub use sync::{StoreSync, StoreSyncSettings};

pub const LIVE_DATA_COLLECTION: &str = "live_data";
pub const TRANSMITTER_STATUS_COLLECTION: &str = "transmitter_status";
pub const COMMAND_QUEUE_COLLECTION: &str = "command_queue";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid document path '{0}', expected 'collection/document'")]
    InvalidPath(String),

    #[error("Snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),
}

/// `collection/document` address of one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentPath {
    pub collection: String,
    pub document: String,
}

impl DocumentPath {
    pub fn new(collection: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            document: document.into(),
        }
    }

    pub fn parse(path: &str) -> Result<Self, StoreError> {
        match path.split_once('/') {
            Some((collection, document))
                if !collection.is_empty() && !document.is_empty() && !document.contains('/') =>
            {
                Ok(Self::new(collection, document))
            }
            _ => Err(StoreError::InvalidPath(path.to_string())),
        }
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.document)
    }
}

/// A partial-document patch for one path.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreUpdate {
    pub path: DocumentPath,
    /// Field path (dot separated) to value.
    pub patch: Map<String, Value>,
}

impl StoreUpdate {
    pub fn new(path: DocumentPath) -> Self {
        Self {
            path,
            patch: Map::new(),
        }
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.patch.insert(field.into(), value.into());
        self
    }
}

/// A remote write intent read from the command queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(default)]
    pub command_id: String,
    #[serde(alias = "target_plc", deserialize_with = "station_from_number_or_label")]
    pub target_station: StationId,
    #[serde(alias = "device")]
    pub target_address: String,
    pub value: i16,
}

fn station_from_number_or_label<'de, D>(deserializer: D) -> Result<StationId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u16),
        Label(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(StationId(n)),
        Raw::Label(label) => StationId::from_label(&label)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid station '{}'", label))),
    }
}

/// How a queued command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandDisposition {
    Processed,
    Rejected(String),
}

impl CommandDisposition {
    pub fn status(&self) -> &'static str {
        match self {
            CommandDisposition::Processed => "processed",
            CommandDisposition::Rejected(_) => "rejected",
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Applies every update or none of them.
    async fn commit(&self, batch: Vec<StoreUpdate>) -> Result<(), StoreError>;

    /// Pending commands, in arrival order. Handed out once.
    fn take_command_feed(&self) -> Option<mpsc::UnboundedReceiver<CommandRequest>>;

    async fn mark_command(
        &self,
        command_id: &str,
        disposition: CommandDisposition,
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_path_requires_two_segments() {
        assert_eq!(
            DocumentPath::parse("live_data/005").unwrap(),
            DocumentPath::new("live_data", "005")
        );
        assert!(DocumentPath::parse("live_data").is_err());
        assert!(DocumentPath::parse("live_data/").is_err());
        assert!(DocumentPath::parse("a/b/c").is_err());
    }

    #[test]
    fn command_request_accepts_queue_document_field_names() {
        let request: CommandRequest = serde_json::from_value(serde_json::json!({
            "target_plc": "plc-005",
            "device": "D2000",
            "value": 77
        }))
        .unwrap();
        assert_eq!(request.target_station, StationId(5));
        assert_eq!(request.target_address, "D2000");

        let request: CommandRequest = serde_json::from_value(serde_json::json!({
            "commandId": "c1",
            "targetStation": 5,
            "targetAddress": "D2000",
            "value": 77
        }))
        .unwrap();
        assert_eq!(request.command_id, "c1");
        assert_eq!(request.value, 77);
    }

    #[test]
    fn command_request_rejects_bad_station() {
        let result: Result<CommandRequest, _> = serde_json::from_value(serde_json::json!({
            "targetStation": "boiler",
            "targetAddress": "D2000",
            "value": 1
        }));
        assert!(result.is_err());
    }
}
