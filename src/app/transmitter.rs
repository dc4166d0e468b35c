//! Field side: stations, telemetry publishing, remote commands.

use crate::config::BridgeConfig;
use crate::device::driver::SimulatedPlcFactory;
use crate::device::{DeviceRegistry, DriverFactory};
use crate::mqtt::topic::StatusTopic;
use crate::mqtt::{BusClient, BusMessage, MqttBus};
use crate::routing::{CommandGateway, MessageRouter};
use crate::telemetry::spawn_stations;
use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub fn presence_topic(config: &BridgeConfig) -> String {
    StatusTopic::new(config.transmitter.hierarchy(), config.transmitter.id.as_str()).to_string()
}

pub struct Transmitter {
    registry: Arc<DeviceRegistry>,
    bus: Arc<dyn BusClient>,
    cancel: CancellationToken,
    supervisors: Vec<JoinHandle<()>>,
    router_task: JoinHandle<()>,
}

impl Transmitter {
    /// Subscribes to commands for every configured line and starts one
    /// supervisor per station.
    pub async fn start(
        config: &BridgeConfig,
        bus: Arc<dyn BusClient>,
        inbound: mpsc::Receiver<BusMessage>,
        factory: Arc<dyn DriverFactory>,
    ) -> Result<Self> {
        let registry = Arc::new(DeviceRegistry::new(factory, config.serializer_settings()));
        let cancel = CancellationToken::new();

        for hierarchy in config.command_hierarchies() {
            bus.subscribe(&hierarchy.command_filter()).await?;
        }

        let gateway = Arc::new(CommandGateway::new(registry.clone()));
        let router = MessageRouter::new().with_command_gateway(gateway);
        let router_task = tokio::spawn(router.run(inbound, cancel.clone()));

        let devices = config.devices();
        if devices.is_empty() {
            warn!("No stations configured");
        }
        info!(
            "Transmitter {} starting {} stations",
            config.transmitter.id,
            devices.len()
        );
        let supervisors = spawn_stations(
            devices,
            registry.clone(),
            bus.clone(),
            config.publisher_settings(),
            cancel.clone(),
        );

        Ok(Self {
            registry,
            bus,
            cancel,
            supervisors,
            router_task,
        })
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Stops polling, closes every station, then leaves the bus.
    pub async fn shutdown(self) {
        info!("Transmitter shutting down");
        self.cancel.cancel();

        for supervisor in self.supervisors {
            if let Err(e) = supervisor.await {
                error!("Station supervisor failed: {}", e);
            }
        }
        if let Err(e) = self.router_task.await {
            error!("Command router failed: {}", e);
        }

        self.registry.shutdown().await;

        if let Err(e) = self.bus.disconnect().await {
            warn!("Bus disconnect failed: {}", e);
        }
        info!("Transmitter stopped");
    }
}

/// Runs the transmitter against the configured broker until Ctrl-C.
pub async fn run(config: BridgeConfig) -> Result<()> {
    let (bus, inbound) = MqttBus::connect(&config.broker, Some(presence_topic(&config)))?;
    // The vendor driver binding plugs in here; the simulated PLC stands in
    let factory = Arc::new(SimulatedPlcFactory::new());

    let transmitter = Transmitter::start(&config, Arc::new(bus), inbound, factory).await?;
    super::shutdown_signal().await;
    transmitter.shutdown().await;
    Ok(())
}
