//! Payload records, one per message category.
//!
//! Parsing is strict: a payload that does not match its record is rejected
//! as a whole instead of being probed field by field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, thiserror::Error)]
#[error("malformed {kind} payload: {source}")]
pub struct PayloadError {
    pub kind: &'static str,
    #[source]
    pub source: serde_json::Error,
}

/// A telemetry value. Integers are tried before floats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
}

impl From<i16> for PointValue {
    fn from(value: i16) -> Self {
        PointValue::Integer(i64::from(value))
    }
}

impl From<PointValue> for serde_json::Value {
    fn from(value: PointValue) -> Self {
        match value {
            PointValue::Bool(b) => serde_json::Value::Bool(b),
            PointValue::Integer(i) => serde_json::Value::from(i),
            PointValue::Float(f) => serde_json::Value::from(f),
        }
    }
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PointValue::Bool(b) => write!(f, "{}", b),
            PointValue::Integer(i) => write!(f, "{}", i),
            PointValue::Float(x) => write!(f, "{}", x),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub value: PointValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TelemetryPayload {
    pub fn now(value: impl Into<PointValue>) -> Self {
        Self {
            value: value.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Online,
    Offline,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Online => "online",
            LinkState::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub state: LinkState,
}

impl StatusPayload {
    pub fn online() -> Self {
        Self {
            state: LinkState::Online,
        }
    }

    pub fn offline() -> Self {
        Self {
            state: LinkState::Offline,
        }
    }
}

/// Write command; the value must fit one 16-bit device word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub value: i16,
}

/// Message categories that have a payload record.
pub trait Payload: Serialize + for<'de> Deserialize<'de> {
    const KIND: &'static str;

    fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        serde_json::from_slice(bytes).map_err(|source| PayloadError {
            kind: Self::KIND,
            source,
        })
    }

    fn encode(&self) -> Vec<u8> {
        // Plain structs of numbers, strings and enums always serialize
        serde_json::to_vec(self).unwrap_or_default()
    }
}

impl Payload for TelemetryPayload {
    const KIND: &'static str = "telemetry";
}

impl Payload for StatusPayload {
    const KIND: &'static str = "status";
}

impl Payload for CommandPayload {
    const KIND: &'static str = "command";
}
