//! Remote write commands to hardware.
//!
//! A command is accepted only for a station that is connected right now.
//! Anything else is logged and dropped; nothing is queued for later.
//!
//! Once the station is looked up, the write goes onto its queue without
//! waiting, so commands for one station reach the hardware in arrival order
//! while commands for different stations never wait on each other.

use crate::device::{ConnectionState, DeviceError, DeviceRegistry, Serializer, StationId};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Written,
    /// Station unknown or not connected; no hardware call was made.
    Dropped,
    Failed(DeviceError),
}

pub struct CommandGateway {
    registry: Arc<DeviceRegistry>,
}

impl CommandGateway {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// Writes one word to `address` on `station` and waits for the result.
    pub async fn execute(&self, station: StationId, address: &str, value: i16) -> CommandOutcome {
        match self.connected(station, address, value).await {
            Some(serializer) => write(&serializer, address, value).await,
            None => CommandOutcome::Dropped,
        }
    }

    /// Queues the write and returns without waiting for the hardware. The
    /// result is logged by a background task.
    pub async fn dispatch(
        &self,
        station: StationId,
        address: &str,
        value: i16,
    ) -> Option<JoinHandle<CommandOutcome>> {
        let serializer = self.connected(station, address, value).await?;
        Some(tokio::spawn(write(&serializer, address, value)))
    }

    async fn connected(&self, station: StationId, address: &str, value: i16) -> Option<Arc<Serializer>> {
        match self.registry.serializer(station).await {
            Ok(serializer) if serializer.state() == ConnectionState::Connected => Some(serializer),
            _ => {
                warn!(
                    "Dropping command {} <- {} for station {}: not connected or managed",
                    address, value, station
                );
                None
            }
        }
    }
}

/// Puts the write on the station's queue now; the returned future only
/// awaits its reply.
fn write(
    serializer: &Serializer,
    address: &str,
    value: i16,
) -> impl Future<Output = CommandOutcome> + Send + 'static {
    let station = serializer.station();
    let reply = serializer.write_block(address, vec![value]);
    let address = address.to_string();
    async move {
        match reply.await {
            Ok(()) => {
                info!("Wrote {} to {} on station {}", value, address, station);
                CommandOutcome::Written
            }
            // Connection went away between the check and the write
            Err(e @ (DeviceError::NotConnected(_) | DeviceError::NotManaged(_))) => {
                warn!("Dropping command for station {}: {}", station, e);
                CommandOutcome::Dropped
            }
            Err(e) => {
                error!(
                    "Write of {} to {} on station {} failed: {}",
                    value, address, station, e
                );
                CommandOutcome::Failed(e)
            }
        }
    }
}
