//! Per-station poller with statum typestates.
//!
//! A poller can only poll in `Polling`, and can only be handed back to the
//! supervisor for reconnection from `Disconnected`; the compiler enforces
//! both.

use super::{hierarchy_of, PublisherSettings};
use crate::device::{Device, DeviceError, DeviceRegistry, StationId};
use crate::mqtt::payload::{LinkState, Payload, StatusPayload, TelemetryPayload};
use crate::mqtt::topic::{StatusTopic, TelemetryTopic};
use crate::mqtt::BusClient;
use statum::{machine, state};
use std::sync::Arc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[state]
#[derive(Debug, Clone)]
pub enum PollerState {
    Idle,
    Polling,
    Disconnected,
}

#[machine]
pub struct StationPoller<S: PollerState> {
    device: Device,
    registry: Arc<DeviceRegistry>,
    bus: Arc<dyn BusClient>,
    settings: PublisherSettings,
    // Connectivity error that ended the last polling run
    last_error: Option<DeviceError>,
}

/// How a polling run ended.
pub enum PollOutcome {
    Stopped(StationPoller<Idle>),
    Disconnected(StationPoller<Disconnected>),
}

impl<S: PollerState> StationPoller<S> {
    pub fn station(&self) -> StationId {
        self.device.station
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    /// Publishes the station's retained link state.
    pub async fn announce(&self, state: LinkState) {
        let topic = StatusTopic::new(hierarchy_of(&self.device), self.device.station.label());
        let payload = StatusPayload { state }.encode();
        match self.bus.publish(&topic.to_string(), payload, true).await {
            Ok(()) => debug!("Station {} announced {}", self.device.station, state.as_str()),
            Err(e) => warn!(
                "Failed to announce station {} {}: {}",
                self.device.station,
                state.as_str(),
                e
            ),
        }
    }
}

impl StationPoller<Idle> {
    pub fn create(
        device: Device,
        registry: Arc<DeviceRegistry>,
        bus: Arc<dyn BusClient>,
        settings: PublisherSettings,
    ) -> Self {
        debug!(
            "Creating poller for station {} with {} points",
            device.station,
            device.points.len()
        );
        Self::new(device, registry, bus, settings, None)
    }

    /// Opens the station link. `false` when the driver refused or the worker
    /// could not be reached.
    pub async fn connect(&self) -> bool {
        match self.registry.connect(self.device.station).await {
            Ok(true) => true,
            Ok(false) => {
                warn!("Station {} refused connection", self.device.station);
                false
            }
            Err(e) => {
                error!("Station {} connect failed: {}", self.device.station, e);
                false
            }
        }
    }

    pub fn start(self) -> StationPoller<Polling> {
        info!(
            "Polling station {} every {:?}",
            self.device.station, self.settings.poll_interval
        );
        self.transition()
    }
}

impl StationPoller<Polling> {
    /// Reads every point once, in configured order, and publishes per the
    /// policy. Returns how many values were published.
    ///
    /// A point the hardware rejects is logged and followed by the error
    /// backoff; the remaining points are still read. A connectivity error
    /// ends the pass immediately.
    ///
    /// Publishing never waits on the network. A value the bus client cannot
    /// queue right away is dropped and stays unobserved, so the next pass
    /// sends it again.
    pub async fn poll_once(&mut self, cancel: &CancellationToken) -> Result<usize, DeviceError> {
        let station = self.device.station;
        let hierarchy = hierarchy_of(&self.device);
        let mut published = 0;

        for point in self.device.points.iter_mut() {
            if cancel.is_cancelled() {
                break;
            }

            let value = match self.registry.read_block(station, &point.address, 1).await {
                Ok(values) => match values.first() {
                    Some(&value) => value,
                    None => continue,
                },
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => {
                    error!("Read of {} failed: {}", point.address, e);
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = time::sleep(self.settings.error_backoff) => {}
                    }
                    continue;
                }
            };

            if !self
                .settings
                .policy
                .should_publish(point.last_observed_value, value)
            {
                continue;
            }

            let topic = TelemetryTopic::new(hierarchy.clone(), station, point.address.as_str());
            let payload = TelemetryPayload::now(value).encode();
            match self.bus.try_publish(&topic.to_string(), payload, false) {
                Ok(()) => {
                    debug!("{} = {}", topic, value);
                    point.last_observed_value = Some(value);
                    published += 1;
                }
                Err(e) => warn!("Dropping telemetry {}: {}", topic, e),
            }
        }

        Ok(published)
    }

    /// Polls on the configured interval until shutdown or a connectivity
    /// failure.
    pub async fn run(mut self, cancel: &CancellationToken) -> PollOutcome {
        let mut interval = time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Polling of station {} stopped", self.device.station);
                    return PollOutcome::Stopped(self.transition());
                }
                _ = interval.tick() => {}
            }

            if let Err(e) = self.poll_once(cancel).await {
                warn!("Station {} lost: {}", self.device.station, e);
                self.last_error = Some(e);
                return PollOutcome::Disconnected(self.transition());
            }
        }
    }
}

impl StationPoller<Disconnected> {
    pub fn last_error(&self) -> Option<&DeviceError> {
        self.last_error.as_ref()
    }

    /// Closes the link and forgets observed values so the first read after
    /// reconnecting is published again.
    pub async fn recover(mut self) -> StationPoller<Idle> {
        match self.registry.disconnect(self.device.station).await {
            Ok(()) | Err(DeviceError::NotManaged(_)) => {}
            Err(e) => warn!("Station {} disconnect failed: {}", self.device.station, e),
        }
        for point in self.device.points.iter_mut() {
            point.last_observed_value = None;
        }
        self.last_error = None;
        self.transition()
    }
}
