//! Server side: bus to document store, command queue to bus.

use crate::config::BridgeConfig;
use crate::mqtt::topic::{STATUS_FILTER, TELEMETRY_FILTER};
use crate::mqtt::{BusClient, BusMessage, MqttBus};
use crate::routing::MessageRouter;
use crate::store::{CommandRelay, DocumentStore, MemoryStore, StoreSync};
use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Server {
    bus: Arc<dyn BusClient>,
    sync: Arc<StoreSync>,
    cancel: CancellationToken,
    router_task: JoinHandle<()>,
    relay_task: JoinHandle<()>,
}

impl Server {
    pub async fn start(
        config: &BridgeConfig,
        bus: Arc<dyn BusClient>,
        inbound: mpsc::Receiver<BusMessage>,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();

        bus.subscribe(TELEMETRY_FILTER).await?;
        bus.subscribe(STATUS_FILTER).await?;

        let sync = Arc::new(StoreSync::spawn(store.clone(), config.store_sync_settings()));
        let router = MessageRouter::new().with_store_sync(sync.clone());
        let router_task = tokio::spawn(router.run(inbound, cancel.clone()));

        let relay = CommandRelay::new(store, bus.clone(), config.default_command_hierarchy())
            .with_stations(
                config
                    .stations
                    .iter()
                    .map(|station| (station.station, config.station_hierarchy(station))),
            );
        let relay_task = tokio::spawn(relay.run(cancel.clone()));

        info!("Server started");
        Ok(Self {
            bus,
            sync,
            cancel,
            router_task,
            relay_task,
        })
    }

    /// Stops intake, flushes pending store writes, then leaves the bus.
    pub async fn shutdown(self) {
        info!("Server shutting down");
        self.cancel.cancel();

        if let Err(e) = self.router_task.await {
            error!("Message router failed: {}", e);
        }
        if let Err(e) = self.relay_task.await {
            error!("Command relay failed: {}", e);
        }
        self.sync.shutdown().await;

        if let Err(e) = self.bus.disconnect().await {
            warn!("Bus disconnect failed: {}", e);
        }
        info!("Server stopped");
    }
}

/// Runs the server against the configured broker until Ctrl-C.
pub async fn run(config: BridgeConfig) -> Result<()> {
    let store = match &config.server.snapshot_path {
        Some(path) => MemoryStore::open(path).await?,
        None => {
            warn!("No snapshot_path configured, store contents are lost on exit");
            MemoryStore::new()
        }
    };
    let (bus, inbound) = MqttBus::connect(&config.broker, None)?;

    let server = Server::start(&config, Arc::new(bus), inbound, Arc::new(store)).await?;
    super::shutdown_signal().await;
    server.shutdown().await;
    Ok(())
}
