//! Telemetry and status messages to document-store updates.
//!
//! The mapping is pure. Writing is done by one background task that groups
//! whatever updates are ready into a single commit, so a slow store delays
//! documents but never the bus listener.
//!
//! | Message                                    | Document                          | Patch                                    |
//! |--------------------------------------------|-----------------------------------|------------------------------------------|
//! | `dt/{s}/{a}/{l}/plc-005/D1000` `{value}`   | `live_data/005`                   | `devices.D1000 = value`, `last_update`   |
//! | `status/{s}/{a}/{l}/{id}/connection`       | `transmitter_status/{id}`         | `state`, `last_seen`                     |

use super::{
    DocumentPath, DocumentStore, StoreUpdate, LIVE_DATA_COLLECTION, TRANSMITTER_STATUS_COLLECTION,
};
use crate::mqtt::payload::{StatusPayload, TelemetryPayload};
use crate::mqtt::topic::{StatusTopic, TelemetryTopic};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub fn telemetry_update(
    topic: &TelemetryTopic,
    payload: &TelemetryPayload,
    received_at: DateTime<Utc>,
) -> StoreUpdate {
    StoreUpdate::new(DocumentPath::new(LIVE_DATA_COLLECTION, topic.document_id()))
        .set(format!("devices.{}", topic.address), payload.value)
        .set("last_update", received_at.to_rfc3339())
}

pub fn status_update(
    topic: &StatusTopic,
    payload: &StatusPayload,
    received_at: DateTime<Utc>,
) -> StoreUpdate {
    StoreUpdate::new(DocumentPath::new(
        TRANSMITTER_STATUS_COLLECTION,
        topic.emitter.as_str(),
    ))
    .set("state", payload.state.as_str())
    .set("last_seen", received_at.to_rfc3339())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSyncSettings {
    /// Largest number of updates in one commit.
    pub batch_max: usize,
    /// How long to keep collecting after the first update of a batch.
    pub batch_window_ms: u64,
    pub queue_capacity: usize,
}

impl Default for StoreSyncSettings {
    fn default() -> Self {
        Self {
            batch_max: 100,
            batch_window_ms: 50,
            queue_capacity: 1000,
        }
    }
}

impl StoreSyncSettings {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

/// Handle to the batched writer task.
pub struct StoreSync {
    update_tx: mpsc::Sender<StoreUpdate>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StoreSync {
    pub fn spawn(store: Arc<dyn DocumentStore>, settings: StoreSyncSettings) -> Self {
        let (update_tx, update_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let writer = BatchWriter {
            store,
            settings,
            update_rx,
        };
        let task = tokio::spawn(writer.run(shutdown_rx));

        Self {
            update_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    /// Queues one update. Waits only if the writer is far behind.
    pub async fn submit(&self, update: StoreUpdate) {
        if self.update_tx.send(update).await.is_err() {
            warn!("Store writer stopped, dropping update");
        }
    }

    /// Flushes queued updates and stops the writer.
    pub async fn shutdown(&self) {
        let shutdown_tx = self.shutdown_tx.lock().ok().and_then(|mut tx| tx.take());
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Store writer task failed: {}", e);
            }
        }
    }
}

struct BatchWriter {
    store: Arc<dyn DocumentStore>,
    settings: StoreSyncSettings,
    update_rx: mpsc::Receiver<StoreUpdate>,
}

impl BatchWriter {
    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) {
        info!("Store writer started");
        loop {
            let first = tokio::select! {
                update = self.update_rx.recv() => update,
                _ = &mut shutdown_rx => None,
            };
            let Some(first) = first else { break };

            let batch = self.collect(first).await;
            self.commit(batch).await;
        }

        // Drain what was queued before shutdown
        self.update_rx.close();
        let mut rest = Vec::new();
        while let Some(update) = self.update_rx.recv().await {
            rest.push(update);
            if rest.len() >= self.settings.batch_max.max(1) {
                self.commit(std::mem::take(&mut rest)).await;
            }
        }
        self.commit(rest).await;
        info!("Store writer stopped");
    }

    async fn collect(&mut self, first: StoreUpdate) -> Vec<StoreUpdate> {
        let batch_max = self.settings.batch_max.max(1);
        let mut batch = vec![first];

        while batch.len() < batch_max {
            match self.update_rx.try_recv() {
                Ok(update) => batch.push(update),
                Err(_) => break,
            }
        }

        let deadline = Instant::now() + self.settings.batch_window();
        while batch.len() < batch_max {
            match tokio::time::timeout_at(deadline, self.update_rx.recv()).await {
                Ok(Some(update)) => batch.push(update),
                Ok(None) | Err(_) => break,
            }
        }
        batch
    }

    async fn commit(&self, batch: Vec<StoreUpdate>) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        match self.store.commit(batch).await {
            Ok(()) => debug!("Wrote {} updates", count),
            Err(e) => error!("Store batch of {} updates failed: {}", count, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::payload::PointValue;
    use crate::mqtt::topic::Hierarchy;
    use crate::store::{CommandDisposition, CommandRequest, MemoryStore, StoreError};
    use async_trait::async_trait;
    use serde_json::json;

    fn hierarchy() -> Hierarchy {
        Hierarchy::new("s1", "a1", "l1")
    }

    #[test]
    fn telemetry_maps_to_live_data_field() {
        let topic = TelemetryTopic::new(hierarchy(), crate::device::StationId(5), "D1000");
        let payload = TelemetryPayload {
            value: PointValue::Integer(42),
            timestamp: None,
        };
        let now = Utc::now();
        let update = telemetry_update(&topic, &payload, now);

        assert_eq!(update.path, DocumentPath::new("live_data", "005"));
        assert_eq!(update.patch["devices.D1000"], json!(42));
        assert_eq!(update.patch["last_update"], json!(now.to_rfc3339()));
    }

    #[test]
    fn last_update_uses_receive_time_not_sender_clock() {
        let topic = TelemetryTopic::new(hierarchy(), crate::device::StationId(5), "D1000");
        let sent_at = Utc::now() - chrono::Duration::hours(3);
        let payload = TelemetryPayload {
            value: PointValue::Integer(1),
            timestamp: Some(sent_at),
        };
        let received_at = Utc::now();

        let update = telemetry_update(&topic, &payload, received_at);

        assert_eq!(update.patch["last_update"], json!(received_at.to_rfc3339()));
        assert_ne!(update.patch["last_update"], json!(sent_at.to_rfc3339()));
    }

    #[test]
    fn status_maps_to_transmitter_document() {
        let topic = StatusTopic::new(hierarchy(), "tx-01");
        let update = status_update(&topic, &StatusPayload::offline(), Utc::now());

        assert_eq!(update.path, DocumentPath::new("transmitter_status", "tx-01"));
        assert_eq!(update.patch["state"], json!("offline"));
        assert!(update.patch.contains_key("last_seen"));
    }

    /// Counts commits and can be told to fail them.
    struct CountingStore {
        inner: MemoryStore,
        commits: Mutex<Vec<usize>>,
        fail: bool,
    }

    #[async_trait]
    impl DocumentStore for CountingStore {
        async fn commit(&self, batch: Vec<StoreUpdate>) -> Result<(), StoreError> {
            self.commits.lock().unwrap().push(batch.len());
            if self.fail {
                return Err(StoreError::InvalidPath("offline".into()));
            }
            self.inner.commit(batch).await
        }

        fn take_command_feed(&self) -> Option<mpsc::UnboundedReceiver<CommandRequest>> {
            None
        }

        async fn mark_command(&self, _: &str, _: CommandDisposition) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn counting(fail: bool) -> Arc<CountingStore> {
        Arc::new(CountingStore {
            inner: MemoryStore::new(),
            commits: Mutex::new(Vec::new()),
            fail,
        })
    }

    #[tokio::test]
    async fn ready_updates_are_committed_together() {
        let store = counting(false);
        let sync = StoreSync::spawn(
            store.clone(),
            StoreSyncSettings {
                batch_max: 10,
                batch_window_ms: 200,
                queue_capacity: 100,
            },
        );

        for i in 0..5 {
            sync.submit(
                StoreUpdate::new(DocumentPath::new("live_data", "005"))
                    .set(format!("devices.D{}", i), i),
            )
            .await;
        }
        sync.shutdown().await;

        let commits = store.commits.lock().unwrap().clone();
        assert_eq!(commits.iter().sum::<usize>(), 5);
        assert!(commits.len() < 5, "expected batching, got {:?}", commits);

        let document = store
            .inner
            .document(&DocumentPath::new("live_data", "005"))
            .await
            .unwrap();
        assert_eq!(document["devices"]["D4"], json!(4));
    }

    #[tokio::test]
    async fn batch_size_is_capped() {
        let store = counting(false);
        let sync = StoreSync::spawn(
            store.clone(),
            StoreSyncSettings {
                batch_max: 2,
                batch_window_ms: 100,
                queue_capacity: 100,
            },
        );
        for i in 0..5 {
            sync.submit(StoreUpdate::new(DocumentPath::new("live_data", "001")).set("devices.D0", i))
                .await;
        }
        sync.shutdown().await;

        let commits = store.commits.lock().unwrap().clone();
        assert!(commits.iter().all(|&n| n <= 2), "{:?}", commits);
        assert_eq!(commits.iter().sum::<usize>(), 5);
    }

    #[tokio::test]
    async fn failed_commit_does_not_stop_the_writer() {
        let store = counting(true);
        let sync = StoreSync::spawn(
            store.clone(),
            StoreSyncSettings {
                batch_max: 1,
                batch_window_ms: 0,
                queue_capacity: 10,
            },
        );
        sync.submit(StoreUpdate::new(DocumentPath::new("live_data", "001")).set("a", 1))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        sync.submit(StoreUpdate::new(DocumentPath::new("live_data", "001")).set("a", 2))
            .await;
        sync.shutdown().await;

        assert_eq!(store.commits.lock().unwrap().len(), 2);
    }
}
