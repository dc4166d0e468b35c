use chrono::{DateTime, Utc};
use std::fmt;

/// A message as received from or sent to the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
    pub received_at: DateTime<Utc>,
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload_str().chars().take(48).collect();
        write!(f, "{} - {}", self.topic, preview)
    }
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        BusMessage {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
            received_at: Utc::now(),
        }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }

    /// Payload as text, lossy for logs.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_truncates_long_payloads() {
        let msg = BusMessage::new("dt/a/b/c/plc-001/D0", "x".repeat(200));
        let shown = msg.to_string();
        assert!(shown.starts_with("dt/a/b/c/plc-001/D0 - "));
        assert_eq!(shown.len(), "dt/a/b/c/plc-001/D0 - ".len() + 48);
    }

    #[test]
    fn short_payload_is_not_padded_or_split() {
        let msg = BusMessage::new("status/a/b/c/t/connection", "{}");
        assert_eq!(msg.to_string(), "status/a/b/c/t/connection - {}");
    }
}
