//! TOML configuration shared by both processes.
//!
//! ```toml
//! [broker]
//! host = "10.0.0.5"
//!
//! [transmitter]
//! id = "transmitter-01"
//! site = "factory-01"
//! area = "assembly"
//! line = "line-a"
//! publish_policy = "on_change"
//!
//! [server]
//! snapshot_path = "/var/lib/plclink/store.json"
//!
//! [[stations]]
//! station = 1
//! description = "Press 1"
//!
//! [[stations.points]]
//! address = "D1000"
//! description = "Spindle speed"
//! ```

use crate::device::{Device, MonitoredPoint, SerializerSettings, StationId};
use crate::mqtt::topic::Hierarchy;
use crate::mqtt::MqttConfig;
use crate::store::StoreSyncSettings;
use crate::telemetry::{PublishPolicy, PublisherSettings};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/plclink";
const CONFIG_FILE: &str = "plclink.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub broker: MqttConfig,
    #[serde(default)]
    pub transmitter: TransmitterConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stations: Vec<StationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmitterConfig {
    /// Emitter id in the transmitter's presence topic.
    pub id: String,
    pub site: String,
    pub area: String,
    pub line: String,
    pub poll_interval_ms: u64,
    pub error_backoff_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub max_reconnect_backoff_ms: u64,
    pub operation_timeout_ms: u64,
    pub publish_policy: PublishPolicy,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        Self {
            id: "transmitter-01".to_string(),
            site: "factory-01".to_string(),
            area: "assembly".to_string(),
            line: "line-a".to_string(),
            poll_interval_ms: 1000,
            error_backoff_ms: 2000,
            reconnect_backoff_ms: 1000,
            max_reconnect_backoff_ms: 30_000,
            operation_timeout_ms: 5000,
            publish_policy: PublishPolicy::OnChange,
        }
    }
}

impl TransmitterConfig {
    pub fn hierarchy(&self) -> Hierarchy {
        Hierarchy::new(self.site.as_str(), self.area.as_str(), self.line.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// JSON file the document store is persisted to. In memory only when
    /// unset.
    pub snapshot_path: Option<PathBuf>,
    pub batch_max: usize,
    pub batch_window_ms: u64,
    /// Line that queued commands for unconfigured stations are sent to.
    pub command_site: String,
    pub command_area: String,
    pub command_line: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let sync = StoreSyncSettings::default();
        let transmitter = TransmitterConfig::default();
        Self {
            snapshot_path: None,
            batch_max: sync.batch_max,
            batch_window_ms: sync.batch_window_ms,
            command_site: transmitter.site,
            command_area: transmitter.area,
            command_line: transmitter.line,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    pub station: StationId,
    /// Falls back to the transmitter's site/area/line when unset.
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub line: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub points: Vec<PointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointConfig {
    pub address: String,
    #[serde(default)]
    pub description: String,
}

impl BridgeConfig {
    /// `~/.config/plclink/plclink.toml`
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| {
            warn!("Could not determine home directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading config from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        debug!("Config has {} stations", config.stations.len());
        Ok(config)
    }

    /// Writes a default config with one sample station if `path` does not
    /// exist yet.
    pub async fn ensure_default(path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if tokio::fs::try_exists(path).await.map_err(io_error)? {
            return Ok(());
        }

        info!("Creating default config at {}", path.display());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let sample = Self {
            stations: vec![StationConfig {
                station: StationId(1),
                site: None,
                area: None,
                line: None,
                description: "Sample station".to_string(),
                points: vec![PointConfig {
                    address: "D1000".to_string(),
                    description: "Sample word".to_string(),
                }],
            }],
            ..Default::default()
        };
        let content = toml::to_string_pretty(&sample)?;
        tokio::fs::write(path, content).await.map_err(io_error)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.is_empty() {
            return Err(ConfigError::Invalid("broker host is empty".into()));
        }
        if self.transmitter.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.transmitter.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "operation_timeout_ms must be positive".into(),
            ));
        }

        let mut seen = HashSet::new();
        for station in &self.stations {
            if !seen.insert(station.station) {
                return Err(ConfigError::Invalid(format!(
                    "station {} is configured twice",
                    station.station
                )));
            }
            if let Some(point) = station.points.iter().find(|p| p.address.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "station {} has a point with an empty address ({:?})",
                    station.station, point.description
                )));
            }
        }
        Ok(())
    }

    pub fn station_hierarchy(&self, station: &StationConfig) -> Hierarchy {
        let t = &self.transmitter;
        Hierarchy::new(
            station.site.clone().unwrap_or_else(|| t.site.clone()),
            station.area.clone().unwrap_or_else(|| t.area.clone()),
            station.line.clone().unwrap_or_else(|| t.line.clone()),
        )
    }

    /// Devices in configured order, points in configured order.
    pub fn devices(&self) -> Vec<Device> {
        self.stations
            .iter()
            .map(|station| {
                let hierarchy = self.station_hierarchy(station);
                Device {
                    station: station.station,
                    site: hierarchy.site,
                    area: hierarchy.area,
                    line: hierarchy.line,
                    description: station.description.clone(),
                    points: station
                        .points
                        .iter()
                        .map(|p| MonitoredPoint::new(p.address.trim(), p.description.as_str()))
                        .collect(),
                }
            })
            .collect()
    }

    /// Every line with at least one configured station, for command
    /// subscriptions.
    pub fn command_hierarchies(&self) -> Vec<Hierarchy> {
        let mut lines: Vec<Hierarchy> = Vec::new();
        for station in &self.stations {
            let hierarchy = self.station_hierarchy(station);
            if !lines.contains(&hierarchy) {
                lines.push(hierarchy);
            }
        }
        lines
    }

    pub fn default_command_hierarchy(&self) -> Hierarchy {
        Hierarchy::new(
            self.server.command_site.as_str(),
            self.server.command_area.as_str(),
            self.server.command_line.as_str(),
        )
    }

    pub fn publisher_settings(&self) -> PublisherSettings {
        let t = &self.transmitter;
        PublisherSettings {
            poll_interval: Duration::from_millis(t.poll_interval_ms),
            error_backoff: Duration::from_millis(t.error_backoff_ms),
            reconnect_backoff: Duration::from_millis(t.reconnect_backoff_ms.max(1)),
            max_reconnect_backoff: Duration::from_millis(
                t.max_reconnect_backoff_ms.max(t.reconnect_backoff_ms),
            ),
            policy: t.publish_policy,
        }
    }

    pub fn serializer_settings(&self) -> SerializerSettings {
        SerializerSettings {
            operation_timeout: Duration::from_millis(self.transmitter.operation_timeout_ms),
        }
    }

    pub fn store_sync_settings(&self) -> StoreSyncSettings {
        StoreSyncSettings {
            batch_max: self.server.batch_max.max(1),
            batch_window_ms: self.server.batch_window_ms,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [broker]
        host = "10.0.0.5"
        port = 1884

        [transmitter]
        id = "tx-07"
        site = "f1"
        area = "a1"
        line = "l1"
        poll_interval_ms = 250
        publish_policy = "every_poll"

        [server]
        batch_max = 20

        [[stations]]
        station = 5
        description = "Press"

        [[stations.points]]
        address = "D1000"
        description = "Speed"

        [[stations.points]]
        address = "D1001"

        [[stations]]
        station = 6
        line = "l2"
    "#;

    #[test]
    fn parses_full_config() {
        let config = BridgeConfig::parse(FULL).unwrap();
        assert_eq!(config.broker.host, "10.0.0.5");
        assert_eq!(config.broker.port, 1884);
        assert_eq!(config.transmitter.id, "tx-07");
        assert_eq!(config.transmitter.publish_policy, PublishPolicy::EveryPoll);
        assert_eq!(config.server.batch_max, 20);
        assert_eq!(config.server.batch_window_ms, 50);

        let devices = config.devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].station, StationId(5));
        let addresses: Vec<&str> = devices[0].points.iter().map(|p| p.address.as_str()).collect();
        assert_eq!(addresses, vec!["D1000", "D1001"]);
        assert_eq!(devices[1].line, "l2");
        assert_eq!(devices[1].site, "f1");

        assert_eq!(
            config.command_hierarchies(),
            vec![Hierarchy::new("f1", "a1", "l1"), Hierarchy::new("f1", "a1", "l2")]
        );
        assert_eq!(
            config.publisher_settings().poll_interval,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn only_broker_is_required() {
        let config = BridgeConfig::parse("[broker]\nhost = \"localhost\"\n").unwrap();
        assert_eq!(config.transmitter.poll_interval_ms, 1000);
        assert_eq!(config.transmitter.publish_policy, PublishPolicy::OnChange);
        assert!(config.stations.is_empty());
        assert!(BridgeConfig::parse("[transmitter]\nid = \"x\"\n").is_err());
    }

    #[test]
    fn rejects_duplicate_stations() {
        let content = r#"
            [broker]
            host = "h"
            [[stations]]
            station = 1
            [[stations]]
            station = 1
        "#;
        assert!(matches!(
            BridgeConfig::parse(content),
            Err(ConfigError::Invalid(msg)) if msg.contains("twice")
        ));
    }

    #[test]
    fn rejects_empty_address_and_zero_interval() {
        let empty_address = r#"
            [broker]
            host = "h"
            [[stations]]
            station = 1
            [[stations.points]]
            address = " "
        "#;
        assert!(matches!(
            BridgeConfig::parse(empty_address),
            Err(ConfigError::Invalid(_))
        ));

        let zero_interval = "[broker]\nhost = \"h\"\n[transmitter]\npoll_interval_ms = 0\n";
        assert!(matches!(
            BridgeConfig::parse(zero_interval),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn default_config_is_written_once_and_loads() {
        let dir = std::env::temp_dir().join(format!("plclink-config-{}", std::process::id()));
        let path = dir.join("plclink.toml");
        let _ = tokio::fs::remove_dir_all(&dir).await;

        BridgeConfig::ensure_default(&path).await.unwrap();
        let config = BridgeConfig::load(&path).await.unwrap();
        assert_eq!(config.stations.len(), 1);
        assert_eq!(config.stations[0].points[0].address, "D1000");

        tokio::fs::write(&path, "[broker]\nhost = \"kept\"\n").await.unwrap();
        BridgeConfig::ensure_default(&path).await.unwrap();
        assert_eq!(BridgeConfig::load(&path).await.unwrap().broker.host, "kept");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn missing_file_reports_path() {
        let err = BridgeConfig::load("/nonexistent/plclink.toml").await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/plclink.toml"));
    }
}
