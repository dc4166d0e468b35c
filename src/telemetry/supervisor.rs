//! Keeps one station polling for the life of the process.

use super::publisher::{Idle, PollOutcome, StationPoller};
use crate::mqtt::payload::LinkState;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Connects, polls, and reconnects with a doubling backoff until cancelled.
/// The station is announced `online` on every successful connect and
/// `offline` whenever polling stops.
pub async fn supervise(poller: StationPoller<Idle>, cancel: CancellationToken) {
    let station = poller.station();
    let initial_backoff = poller.settings().reconnect_backoff;
    let max_backoff = poller.settings().max_reconnect_backoff;
    let mut backoff = initial_backoff;
    let mut idle = poller;

    info!("Supervising station {}", station);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        if idle.connect().await {
            backoff = initial_backoff;
            idle.announce(LinkState::Online).await;

            match idle.start().run(&cancel).await {
                PollOutcome::Stopped(stopped) => {
                    idle = stopped;
                    break;
                }
                PollOutcome::Disconnected(lost) => {
                    lost.announce(LinkState::Offline).await;
                    idle = lost.recover().await;
                }
            }
        } else {
            idle.announce(LinkState::Offline).await;
        }

        warn!("Reconnecting station {} in {:?}", station, backoff);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = time::sleep(backoff) => {}
        }
        backoff = next_backoff(backoff, max_backoff);
    }

    idle.announce(LinkState::Offline).await;
    info!("Supervisor for station {} stopped", station);
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::driver::SimulatedPlcFactory;
    use crate::device::{Device, DeviceRegistry, MonitoredPoint, SerializerSettings, StationId};
    use crate::mqtt::payload::{Payload, StatusPayload};
    use crate::mqtt::MemoryBus;
    use crate::telemetry::PublisherSettings;
    use std::sync::Arc;

    fn device(station: u16) -> Device {
        Device {
            station: StationId(station),
            site: "f1".into(),
            area: "a1".into(),
            line: "l1".into(),
            description: String::new(),
            points: vec![MonitoredPoint::new("D0", "")],
        }
    }

    fn settings() -> PublisherSettings {
        PublisherSettings {
            poll_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
            reconnect_backoff: Duration::from_millis(10),
            max_reconnect_backoff: Duration::from_millis(40),
            ..Default::default()
        }
    }

    fn link_state(bus: &MemoryBus, topic: &str) -> Option<LinkState> {
        bus.retained(topic)
            .and_then(|m| StatusPayload::decode(&m.payload).ok())
            .map(|p| p.state)
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let max = Duration::from_secs(30);
        assert_eq!(next_backoff(Duration::from_secs(1), max), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(20), max), max);
    }

    #[tokio::test]
    async fn reachable_station_is_announced_and_polled() {
        let bus = MemoryBus::new();
        let registry = Arc::new(DeviceRegistry::new(
            Arc::new(SimulatedPlcFactory::new()),
            SerializerSettings::default(),
        ));
        let (client, _rx) = bus.connect(None);
        let poller = StationPoller::create(device(5), registry.clone(), Arc::new(client), settings());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(poller, cancel.clone()));

        time::sleep(Duration::from_millis(100)).await;
        let status_topic = "status/f1/a1/l1/plc-005/connection";
        assert_eq!(link_state(&bus, status_topic), Some(LinkState::Online));
        assert_eq!(bus.published_matching("dt/#").len(), 1);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(link_state(&bus, status_topic), Some(LinkState::Offline));
    }

    #[tokio::test]
    async fn unreachable_station_keeps_retrying() {
        let bus = MemoryBus::new();
        let registry = Arc::new(DeviceRegistry::new(
            Arc::new(SimulatedPlcFactory::new().with_unreachable(StationId(9))),
            SerializerSettings::default(),
        ));
        let (client, _rx) = bus.connect(None);
        let poller = StationPoller::create(device(9), registry.clone(), Arc::new(client), settings());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(poller, cancel.clone()));

        time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        task.await.unwrap();

        let announcements = bus.published_matching("status/f1/a1/l1/plc-009/connection");
        assert!(announcements.len() >= 3, "{} attempts", announcements.len());
        assert_eq!(
            link_state(&bus, "status/f1/a1/l1/plc-009/connection"),
            Some(LinkState::Offline)
        );
        assert!(bus.published_matching("dt/#").is_empty());
    }

    #[tokio::test]
    async fn lost_station_reconnects_and_republishes() {
        let bus = MemoryBus::new();
        let registry = Arc::new(DeviceRegistry::new(
            Arc::new(SimulatedPlcFactory::new()),
            SerializerSettings::default(),
        ));
        let (client, _rx) = bus.connect(None);
        let poller = StationPoller::create(device(5), registry.clone(), Arc::new(client), settings());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(poller, cancel.clone()));

        time::sleep(Duration::from_millis(60)).await;
        registry.disconnect(StationId(5)).await.unwrap();
        time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        task.await.unwrap();

        let states: Vec<LinkState> = bus
            .published_matching("status/#")
            .iter()
            .filter_map(|m| StatusPayload::decode(&m.payload).ok())
            .map(|p| p.state)
            .collect();
        assert_eq!(states[..3], [LinkState::Online, LinkState::Offline, LinkState::Online]);
        assert_eq!(bus.published_matching("dt/#").len(), 2);
    }
}
