//! Device registry
//!
//! Maps station ids to their [`Serializer`]. A serializer is created the first
//! time a station is connected and lives until the registry shuts down; every
//! other operation on a station that was never connected fails with
//! [`DeviceError::NotManaged`].

use super::driver::DriverFactory;
use super::serializer::{Serializer, SerializerSettings};
use super::{ConnectionState, DeviceError, StationId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info};

pub struct DeviceRegistry {
    serializers: RwLock<HashMap<StationId, Arc<Serializer>>>,
    factory: Arc<dyn DriverFactory>,
    settings: SerializerSettings,
}

impl DeviceRegistry {
    pub fn new(factory: Arc<dyn DriverFactory>, settings: SerializerSettings) -> Self {
        Self {
            serializers: RwLock::new(HashMap::new()),
            factory,
            settings,
        }
    }

    /// The serializer of a station that has been connected at least once.
    pub async fn serializer(&self, station: StationId) -> Result<Arc<Serializer>, DeviceError> {
        self.serializers
            .read()
            .await
            .get(&station)
            .cloned()
            .ok_or(DeviceError::NotManaged(station))
    }

    async fn get_or_spawn(&self, station: StationId) -> Result<Arc<Serializer>, DeviceError> {
        if let Ok(serializer) = self.serializer(station).await {
            return Ok(serializer);
        }
        let mut serializers = self.serializers.write().await;
        if let Some(serializer) = serializers.get(&station) {
            return Ok(serializer.clone());
        }
        let serializer = Arc::new(Serializer::spawn(
            station,
            self.factory.clone(),
            self.settings.clone(),
        )?);
        serializers.insert(station, serializer.clone());
        info!("Registered serializer for station {}", station);
        Ok(serializer)
    }

    /// Connects a station, creating its serializer on first use.
    pub async fn connect(&self, station: StationId) -> Result<bool, DeviceError> {
        let serializer = self.get_or_spawn(station).await?;
        serializer.connect().await
    }

    pub async fn disconnect(&self, station: StationId) -> Result<(), DeviceError> {
        let serializer = self.serializer(station).await?;
        serializer.disconnect().await
    }

    pub async fn read_block(
        &self,
        station: StationId,
        address: &str,
        count: usize,
    ) -> Result<Vec<i16>, DeviceError> {
        let serializer = self.serializer(station).await?;
        serializer.read_block(address, count).await
    }

    pub async fn write_block(
        &self,
        station: StationId,
        address: &str,
        values: Vec<i16>,
    ) -> Result<(), DeviceError> {
        let serializer = self.serializer(station).await?;
        serializer.write_block(address, values).await
    }

    /// `None` for stations that were never connected.
    pub async fn state(&self, station: StationId) -> Option<ConnectionState> {
        self.serializer(station).await.ok().map(|s| s.state())
    }

    pub async fn is_connected(&self, station: StationId) -> bool {
        self.state(station).await == Some(ConnectionState::Connected)
    }

    pub async fn subscribe_state(
        &self,
        station: StationId,
    ) -> Result<watch::Receiver<ConnectionState>, DeviceError> {
        Ok(self.serializer(station).await?.subscribe_state())
    }

    pub async fn stations(&self) -> Vec<StationId> {
        let mut stations: Vec<StationId> = self.serializers.read().await.keys().copied().collect();
        stations.sort();
        stations
    }

    /// Tears down every serializer. Individual failures are logged only.
    pub async fn shutdown(&self) {
        let drained: Vec<(StationId, Arc<Serializer>)> =
            self.serializers.write().await.drain().collect();
        info!("Shutting down {} station serializers", drained.len());

        for (station, serializer) in drained {
            match serializer.shutdown().await {
                Ok(()) => debug!("Station {} released", station),
                Err(e) => error!("Failed to shut down station {}: {}", station, e),
            }
        }
    }
}
