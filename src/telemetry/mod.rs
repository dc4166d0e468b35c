//! # Telemetry Module
//!
//! Field-side polling. Each configured station gets a supervisor task that
//! connects it, runs a [`publisher::StationPoller`] over its monitored points,
//! and brings it back after a connectivity failure.
//!
//! ```text
//!            connect ok                 connectivity error
//!   Idle ───────────────► Polling ─────────────────────────► Disconnected
//!    ▲                       │ shutdown                            │
//!    │                       ▼                                     │
//!    └──────────────────── (exit)        backoff, reconnect ◄──────┘
//! ```
//!
//! Reads go through the [`DeviceRegistry`], so polling shares each station's
//! FIFO queue with remote write commands.

pub mod publisher;
pub mod supervisor;

use crate::device::{Device, DeviceRegistry};
use crate::mqtt::topic::Hierarchy;
use crate::mqtt::BusClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use publisher::{PollOutcome, StationPoller};
pub use supervisor::supervise;

/// When a successful read is published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishPolicy {
    /// Only when the value differs from the last one read. The first read
    /// after (re)connecting always publishes.
    #[default]
    OnChange,
    EveryPoll,
}

impl PublishPolicy {
    pub fn should_publish(&self, previous: Option<i16>, current: i16) -> bool {
        match self {
            PublishPolicy::OnChange => previous != Some(current),
            PublishPolicy::EveryPoll => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub poll_interval: Duration,
    /// Pause after a point's read is rejected by the hardware.
    pub error_backoff: Duration,
    /// First reconnect delay; doubles per failed attempt.
    pub reconnect_backoff: Duration,
    pub max_reconnect_backoff: Duration,
    pub policy: PublishPolicy,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(2),
            reconnect_backoff: Duration::from_secs(1),
            max_reconnect_backoff: Duration::from_secs(30),
            policy: PublishPolicy::OnChange,
        }
    }
}

pub fn hierarchy_of(device: &Device) -> Hierarchy {
    Hierarchy::new(
        device.site.as_str(),
        device.area.as_str(),
        device.line.as_str(),
    )
}

/// Starts one supervisor task per device.
pub fn spawn_stations(
    devices: Vec<Device>,
    registry: Arc<DeviceRegistry>,
    bus: Arc<dyn BusClient>,
    settings: PublisherSettings,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    devices
        .into_iter()
        .map(|device| {
            let poller = StationPoller::create(
                device,
                registry.clone(),
                bus.clone(),
                settings.clone(),
            );
            tokio::spawn(supervise(poller, cancel.clone()))
        })
        .collect()
}
