//! Command queue to bus.
//!
//! Each pending command document is checked, published on its `cmd/...`
//! topic, and then marked in the store. Publishing happens before marking, so
//! a crash in between replays the command rather than losing it.

use super::{CommandDisposition, CommandRequest, DocumentStore};
use crate::device::StationId;
use crate::mqtt::payload::{CommandPayload, Payload};
use crate::mqtt::topic::{CommandTopic, Hierarchy};
use crate::mqtt::BusClient;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct CommandRelay {
    store: Arc<dyn DocumentStore>,
    bus: Arc<dyn BusClient>,
    default_hierarchy: Hierarchy,
    stations: HashMap<StationId, Hierarchy>,
}

impl CommandRelay {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        bus: Arc<dyn BusClient>,
        default_hierarchy: Hierarchy,
    ) -> Self {
        Self {
            store,
            bus,
            default_hierarchy,
            stations: HashMap::new(),
        }
    }

    /// Stations with their own site/area/line. Others use the default.
    pub fn with_stations(mut self, stations: impl IntoIterator<Item = (StationId, Hierarchy)>) -> Self {
        self.stations.extend(stations);
        self
    }

    fn topic_for(&self, request: &CommandRequest) -> CommandTopic {
        let hierarchy = self
            .stations
            .get(&request.target_station)
            .unwrap_or(&self.default_hierarchy)
            .clone();
        CommandTopic::new(hierarchy, request.target_station, request.target_address.as_str())
    }

    /// Runs until cancelled or the store's command feed closes. Returns
    /// immediately if another relay already owns the feed.
    pub async fn run(self, cancel: CancellationToken) {
        let Some(mut feed) = self.store.take_command_feed() else {
            warn!("Command feed already taken, relay not started");
            return;
        };
        info!("Command relay started");

        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = feed.recv() => request,
            };
            match request {
                Some(request) => self.relay(request).await,
                None => break,
            }
        }

        info!("Command relay stopped");
    }

    /// Handles everything currently queued, then returns.
    pub async fn drain(&self, feed: &mut mpsc::UnboundedReceiver<CommandRequest>) {
        while let Ok(request) = feed.try_recv() {
            self.relay(request).await;
        }
    }

    async fn relay(&self, request: CommandRequest) {
        if let Err(reason) = validate(&request) {
            warn!("Rejecting command {}: {}", request.command_id, reason);
            self.mark(&request.command_id, CommandDisposition::Rejected(reason))
                .await;
            return;
        }

        let topic = self.topic_for(&request).to_string();
        let payload = CommandPayload {
            value: request.value,
        }
        .encode();

        match self.bus.publish(&topic, payload, false).await {
            Ok(()) => {
                debug!("Relayed command {} to {}", request.command_id, topic);
                self.mark(&request.command_id, CommandDisposition::Processed)
                    .await;
            }
            // Left pending; it is queued again the next time the store opens
            Err(e) => error!(
                "Failed to publish command {} to {}: {}",
                request.command_id, topic, e
            ),
        }
    }

    async fn mark(&self, command_id: &str, disposition: CommandDisposition) {
        if let Err(e) = self.store.mark_command(command_id, disposition).await {
            error!("Failed to mark command {}: {}", command_id, e);
        }
    }
}

fn validate(request: &CommandRequest) -> Result<(), String> {
    if request.command_id.is_empty() {
        return Err("missing command id".into());
    }
    if request.target_address.is_empty() {
        return Err("empty target address".into());
    }
    if !request
        .target_address
        .bytes()
        .all(|b| b.is_ascii_alphanumeric())
    {
        return Err(format!(
            "address '{}' is not a device address",
            request.target_address
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::MemoryBus;
    use crate::store::{DocumentPath, MemoryStore, COMMAND_QUEUE_COLLECTION};
    use serde_json::json;

    fn relay(store: Arc<MemoryStore>, bus: &MemoryBus) -> CommandRelay {
        let (client, _rx) = bus.connect(None);
        CommandRelay::new(store, Arc::new(client), Hierarchy::new("s1", "a1", "l1"))
            .with_stations([(StationId(7), Hierarchy::new("s2", "a2", "l2"))])
    }

    async fn status(store: &MemoryStore, id: &str) -> serde_json::Value {
        store
            .document(&DocumentPath::new(COMMAND_QUEUE_COLLECTION, id))
            .await
            .unwrap()["status"]
            .clone()
    }

    #[tokio::test]
    async fn publishes_command_and_marks_processed() {
        let store = Arc::new(MemoryStore::new());
        let bus = MemoryBus::new();
        let relay = relay(store.clone(), &bus);
        let mut feed = store.take_command_feed().unwrap();

        store
            .submit_command("c1", json!({"targetStation": 5, "targetAddress": "D2000", "value": 77}))
            .await
            .unwrap();
        store
            .submit_command("c2", json!({"targetStation": 7, "targetAddress": "M10", "value": 1}))
            .await
            .unwrap();
        relay.drain(&mut feed).await;

        let sent = bus.published_matching("cmd/#");
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].topic, "cmd/s1/a1/l1/plc-005/write/D2000");
        assert_eq!(sent[0].payload, br#"{"value":77}"#.to_vec());
        assert_eq!(sent[1].topic, "cmd/s2/a2/l2/plc-007/write/M10");

        assert_eq!(status(&store, "c1").await, json!("processed"));
        assert_eq!(status(&store, "c2").await, json!("processed"));
    }

    #[tokio::test]
    async fn rejects_address_that_would_break_the_topic() {
        let store = Arc::new(MemoryStore::new());
        let bus = MemoryBus::new();
        let relay = relay(store.clone(), &bus);
        let mut feed = store.take_command_feed().unwrap();

        store
            .submit_command("c1", json!({"targetStation": 5, "targetAddress": "D1/#", "value": 1}))
            .await
            .unwrap();
        relay.drain(&mut feed).await;

        assert!(bus.published_matching("cmd/#").is_empty());
        assert_eq!(status(&store, "c1").await, json!("rejected"));
    }

    #[tokio::test]
    async fn failed_publish_leaves_command_pending() {
        let store = Arc::new(MemoryStore::new());
        let bus = MemoryBus::new();
        let (client, _rx) = bus.connect(None);
        client.disconnect().await.unwrap();
        let relay = CommandRelay::new(store.clone(), Arc::new(client), Hierarchy::new("s", "a", "l"));
        let mut feed = store.take_command_feed().unwrap();

        store
            .submit_command("c1", json!({"targetStation": 5, "targetAddress": "D1", "value": 1}))
            .await
            .unwrap();
        relay.drain(&mut feed).await;

        assert_eq!(status(&store, "c1").await, json!("pending"));
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let bus = MemoryBus::new();
        let relay = relay(store.clone(), &bus);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(relay.run(cancel.clone()));

        store
            .submit_command("c1", json!({"targetStation": 5, "targetAddress": "D1", "value": 3}))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(bus.published_matching("cmd/#").len(), 1);
        assert_eq!(status(&store, "c1").await, json!("processed"));
    }
}
