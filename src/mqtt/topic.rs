//! Topic grammar.
//!
//! The first segment classifies the message, the next three place the
//! emitter in the plant hierarchy, and the rest depends on the kind:
//!
//! ```text
//! dt/{site}/{area}/{line}/{emitter}/{address}
//! status/{site}/{area}/{line}/{emitter}/connection
//! cmd/{site}/{area}/{line}/plc-{station}/write/{address}
//! ```

use crate::device::StationId;
use std::fmt;

pub const TELEMETRY_PREFIX: &str = "dt";
pub const STATUS_PREFIX: &str = "status";
pub const COMMAND_PREFIX: &str = "cmd";

const STATUS_SUFFIX: &str = "connection";
const WRITE_SEGMENT: &str = "write";

/// Server-side subscriptions.
pub const TELEMETRY_FILTER: &str = "dt/#";
pub const STATUS_FILTER: &str = "status/#";
/// Transmitter-side subscription.
pub const COMMAND_FILTER: &str = "cmd/+/+/+/+/write/+";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("empty topic")]
    Empty,

    #[error("unknown topic prefix '{0}'")]
    UnknownPrefix(String),

    #[error("{kind} topic needs {expected} segments, got {found}")]
    SegmentCount {
        kind: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{kind} topic has invalid segment {index}: '{segment}'")]
    BadSegment {
        kind: &'static str,
        index: usize,
        segment: String,
    },
}

/// Site, area and line labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hierarchy {
    pub site: String,
    pub area: String,
    pub line: String,
}

impl Hierarchy {
    pub fn new(site: impl Into<String>, area: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            area: area.into(),
            line: line.into(),
        }
    }

    /// Write commands addressed to any station on this line.
    pub fn command_filter(&self) -> String {
        format!("{}/{}/+/{}/+", COMMAND_PREFIX, self, WRITE_SEGMENT)
    }
}

impl fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.site, self.area, self.line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryTopic {
    pub hierarchy: Hierarchy,
    /// Station segment as sent, e.g. `plc-005`. Always a valid station label.
    pub emitter: String,
    pub address: String,
}

impl TelemetryTopic {
    pub fn new(hierarchy: Hierarchy, station: StationId, address: impl Into<String>) -> Self {
        Self {
            hierarchy,
            emitter: station.label(),
            address: address.into(),
        }
    }

    /// Document id under `live_data`: the emitter with its `plc-` prefix removed.
    pub fn document_id(&self) -> &str {
        self.emitter.strip_prefix("plc-").unwrap_or(&self.emitter)
    }
}

impl fmt::Display for TelemetryTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            TELEMETRY_PREFIX, self.hierarchy, self.emitter, self.address
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTopic {
    pub hierarchy: Hierarchy,
    pub emitter: String,
}

impl StatusTopic {
    pub fn new(hierarchy: Hierarchy, emitter: impl Into<String>) -> Self {
        Self {
            hierarchy,
            emitter: emitter.into(),
        }
    }
}

impl fmt::Display for StatusTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            STATUS_PREFIX, self.hierarchy, self.emitter, STATUS_SUFFIX
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopic {
    pub hierarchy: Hierarchy,
    pub station: StationId,
    pub address: String,
}

impl CommandTopic {
    pub fn new(hierarchy: Hierarchy, station: StationId, address: impl Into<String>) -> Self {
        Self {
            hierarchy,
            station,
            address: address.into(),
        }
    }
}

impl fmt::Display for CommandTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            COMMAND_PREFIX,
            self.hierarchy,
            self.station.label(),
            WRITE_SEGMENT,
            self.address
        )
    }
}

/// A classified topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Telemetry(TelemetryTopic),
    Status(StatusTopic),
    Command(CommandTopic),
}

impl Topic {
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        if topic.is_empty() {
            return Err(TopicError::Empty);
        }
        let segments: Vec<&str> = topic.split('/').collect();
        match segments[0] {
            TELEMETRY_PREFIX => parse_telemetry(&segments).map(Topic::Telemetry),
            STATUS_PREFIX => parse_status(&segments).map(Topic::Status),
            COMMAND_PREFIX => parse_command(&segments).map(Topic::Command),
            other => Err(TopicError::UnknownPrefix(other.to_string())),
        }
    }
}

fn expect_segments(
    kind: &'static str,
    segments: &[&str],
    expected: usize,
) -> Result<(), TopicError> {
    if segments.len() != expected {
        return Err(TopicError::SegmentCount {
            kind,
            expected,
            found: segments.len(),
        });
    }
    if let Some((index, segment)) = segments.iter().enumerate().find(|(_, s)| s.is_empty()) {
        return Err(TopicError::BadSegment {
            kind,
            index,
            segment: segment.to_string(),
        });
    }
    Ok(())
}

fn hierarchy(segments: &[&str]) -> Hierarchy {
    Hierarchy::new(segments[1], segments[2], segments[3])
}

fn parse_telemetry(segments: &[&str]) -> Result<TelemetryTopic, TopicError> {
    expect_segments("telemetry", segments, 6)?;
    if StationId::from_label(segments[4]).is_none() {
        return Err(TopicError::BadSegment {
            kind: "telemetry",
            index: 4,
            segment: segments[4].to_string(),
        });
    }
    Ok(TelemetryTopic {
        hierarchy: hierarchy(segments),
        emitter: segments[4].to_string(),
        address: segments[5].to_string(),
    })
}

fn parse_status(segments: &[&str]) -> Result<StatusTopic, TopicError> {
    expect_segments("status", segments, 6)?;
    if segments[5] != STATUS_SUFFIX {
        return Err(TopicError::BadSegment {
            kind: "status",
            index: 5,
            segment: segments[5].to_string(),
        });
    }
    Ok(StatusTopic {
        hierarchy: hierarchy(segments),
        emitter: segments[4].to_string(),
    })
}

fn parse_command(segments: &[&str]) -> Result<CommandTopic, TopicError> {
    expect_segments("command", segments, 7)?;
    let station = StationId::from_label(segments[4]).ok_or_else(|| TopicError::BadSegment {
        kind: "command",
        index: 4,
        segment: segments[4].to_string(),
    })?;
    if segments[5] != WRITE_SEGMENT {
        return Err(TopicError::BadSegment {
            kind: "command",
            index: 5,
            segment: segments[5].to_string(),
        });
    }
    Ok(CommandTopic {
        hierarchy: hierarchy(segments),
        station,
        address: segments[6].to_string(),
    })
}

/// MQTT filter matching with `+` and trailing `#` wildcards.
pub fn matches_filter(filter: &str, topic: &str) -> bool {
    let mut topic_segments = topic.split('/');
    for filter_segment in filter.split('/') {
        match filter_segment {
            "#" => return true,
            "+" => {
                if topic_segments.next().is_none() {
                    return false;
                }
            }
            literal => {
                if topic_segments.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    topic_segments.next().is_none()
}
