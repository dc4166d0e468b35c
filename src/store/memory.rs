//! In-process document store.
//!
//! Documents are JSON objects keyed by `collection/document`. A commit is
//! applied to a copy of the affected documents and swapped in only when every
//! patch in the batch applied, so readers never observe half a batch. When a
//! snapshot path is set, the whole store is written to it after each commit
//! and read back on open.

use super::{
    CommandDisposition, CommandRequest, DocumentPath, DocumentStore, StoreError, StoreUpdate,
    COMMAND_QUEUE_COLLECTION,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

type Documents = BTreeMap<String, Map<String, Value>>;

pub struct MemoryStore {
    documents: RwLock<Documents>,
    snapshot_path: Option<PathBuf>,
    command_tx: mpsc::UnboundedSender<CommandRequest>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<CommandRequest>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_documents(Documents::new(), None)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_documents(documents: Documents, snapshot_path: Option<PathBuf>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            documents: RwLock::new(documents),
            snapshot_path,
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
        }
    }

    /// Opens a store backed by a JSON snapshot file. A missing file starts an
    /// empty store. Commands still pending in the snapshot are queued again.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let documents: Documents = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {}, starting empty", path.display());
                Documents::new()
            }
            Err(e) => return Err(e.into()),
        };

        let pending: Vec<CommandRequest> = documents
            .iter()
            .filter_map(|(key, fields)| match DocumentPath::parse(key) {
                Ok(path) if path.collection == COMMAND_QUEUE_COLLECTION => {
                    pending_command(&path.document, fields)
                }
                Ok(_) => None,
                Err(e) => {
                    warn!("Ignoring snapshot entry: {}", e);
                    None
                }
            })
            .collect();

        info!(
            "Opened store snapshot {} ({} documents, {} pending commands)",
            path.display(),
            documents.len(),
            pending.len()
        );

        let store = Self::with_documents(documents, Some(path));
        for request in pending {
            let _ = store.command_tx.send(request);
        }
        Ok(store)
    }

    /// Current content of one document.
    pub async fn document(&self, path: &DocumentPath) -> Option<Value> {
        let documents = self.documents.read().await;
        documents
            .get(&path.to_string())
            .map(|fields| Value::Object(fields.clone()))
    }

    /// Ids of every document in a collection.
    pub async fn documents_in(&self, collection: &str) -> Vec<String> {
        let prefix = format!("{}/", collection);
        let documents = self.documents.read().await;
        documents
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    /// Adds a document to the command queue. Documents that do not describe a
    /// valid write are stored and immediately marked rejected.
    pub async fn submit_command(&self, command_id: &str, document: Value) -> Result<(), StoreError> {
        let Value::Object(fields) = document else {
            return Err(StoreError::UnknownCommand(command_id.to_string()));
        };

        let path = DocumentPath::new(COMMAND_QUEUE_COLLECTION, command_id);
        let mut update = StoreUpdate::new(path);
        update.patch = fields.clone();
        update.patch.insert("status".into(), Value::from("pending"));
        self.commit(vec![update]).await?;

        match pending_command(command_id, &fields) {
            Some(request) => {
                debug!("Queued command {}", command_id);
                let _ = self.command_tx.send(request);
                Ok(())
            }
            None => {
                warn!("Command {} is not a valid write, rejecting", command_id);
                self.mark_command(
                    command_id,
                    CommandDisposition::Rejected("invalid command document".into()),
                )
                .await
            }
        }
    }

    async fn persist(&self, documents: &Documents) -> Result<(), StoreError> {
        if let Some(path) = &self.snapshot_path {
            let bytes = serde_json::to_vec_pretty(documents)?;
            tokio::fs::write(path, bytes).await?;
        }
        Ok(())
    }
}

fn pending_command(command_id: &str, fields: &Map<String, Value>) -> Option<CommandRequest> {
    let status = fields.get("status").and_then(Value::as_str).unwrap_or("pending");
    if status != "pending" {
        return None;
    }
    let mut request: CommandRequest = serde_json::from_value(Value::Object(fields.clone())).ok()?;
    request.command_id = command_id.to_string();
    Some(request)
}

/// Sets `value` at a dotted field path, creating intermediate maps. A non-map
/// value in the way is replaced.
pub(crate) fn merge_field(document: &mut Map<String, Value>, field: &str, value: Value) {
    let mut parts = field.split('.');
    let Some(mut key) = parts.next() else {
        return;
    };
    let mut current = document;
    for next in parts {
        let slot = current
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => return,
        };
        key = next;
    }
    current.insert(key.to_string(), value);
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn commit(&self, batch: Vec<StoreUpdate>) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut documents = self.documents.write().await;
        let mut staged = documents.clone();
        for update in &batch {
            let document = staged.entry(update.path.to_string()).or_default();
            for (field, value) in &update.patch {
                merge_field(document, field, value.clone());
            }
        }

        self.persist(&staged).await?;
        *documents = staged;
        debug!("Committed batch of {} updates", batch.len());
        Ok(())
    }

    fn take_command_feed(&self) -> Option<mpsc::UnboundedReceiver<CommandRequest>> {
        self.command_rx.lock().ok()?.take()
    }

    async fn mark_command(
        &self,
        command_id: &str,
        disposition: CommandDisposition,
    ) -> Result<(), StoreError> {
        let path = DocumentPath::new(COMMAND_QUEUE_COLLECTION, command_id);
        if self.document(&path).await.is_none() {
            return Err(StoreError::UnknownCommand(command_id.to_string()));
        }

        let mut update = StoreUpdate::new(path)
            .set("status", disposition.status())
            .set("processed_at", Utc::now().to_rfc3339());
        if let CommandDisposition::Rejected(reason) = &disposition {
            update = update.set("reason", reason.as_str());
        }
        self.commit(vec![update]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StationId;
    use serde_json::json;

    fn live(id: &str) -> DocumentPath {
        DocumentPath::new("live_data", id)
    }

    #[tokio::test]
    async fn merge_keeps_untouched_fields() {
        let store = MemoryStore::new();
        store
            .commit(vec![StoreUpdate::new(live("005"))
                .set("devices.D1000", 42)
                .set("devices.D1001", 7)])
            .await
            .unwrap();
        store
            .commit(vec![StoreUpdate::new(live("005")).set("devices.D1000", 43)])
            .await
            .unwrap();

        let document = store.document(&live("005")).await.unwrap();
        assert_eq!(document["devices"]["D1000"], json!(43));
        assert_eq!(document["devices"]["D1001"], json!(7));
    }

    #[test]
    fn merge_field_replaces_scalar_in_the_way() {
        let mut document = Map::new();
        document.insert("devices".into(), json!(5));
        merge_field(&mut document, "devices.D1", json!(1));
        assert_eq!(Value::Object(document), json!({"devices": {"D1": 1}}));
    }

    #[tokio::test]
    async fn batch_touches_several_documents() {
        let store = MemoryStore::new();
        store
            .commit(vec![
                StoreUpdate::new(live("001")).set("devices.D0", 1),
                StoreUpdate::new(live("002")).set("devices.D0", 2),
            ])
            .await
            .unwrap();
        let mut ids = store.documents_in("live_data").await;
        ids.sort();
        assert_eq!(ids, vec!["001", "002"]);
    }

    #[tokio::test]
    async fn failed_persist_leaves_documents_unchanged() {
        let dir = std::env::temp_dir().join(format!("plclink-missing-{}", std::process::id()));
        let store = MemoryStore::with_documents(Documents::new(), Some(dir.join("nested/store.json")));
        let result = store
            .commit(vec![StoreUpdate::new(live("005")).set("devices.D0", 1)])
            .await;
        assert!(result.is_err());
        assert!(store.document(&live("005")).await.is_none());
    }

    #[tokio::test]
    async fn submitted_command_reaches_the_feed_once() {
        let store = MemoryStore::new();
        let mut feed = store.take_command_feed().unwrap();
        assert!(store.take_command_feed().is_none());

        store
            .submit_command(
                "c1",
                json!({"target_plc": "plc-005", "device": "D2000", "value": 77}),
            )
            .await
            .unwrap();

        let request = feed.recv().await.unwrap();
        assert_eq!(request.command_id, "c1");
        assert_eq!(request.target_station, StationId(5));

        store
            .mark_command("c1", CommandDisposition::Processed)
            .await
            .unwrap();
        let document = store
            .document(&DocumentPath::new(COMMAND_QUEUE_COLLECTION, "c1"))
            .await
            .unwrap();
        assert_eq!(document["status"], json!("processed"));
        assert!(document["processed_at"].is_string());
    }

    #[tokio::test]
    async fn invalid_command_is_rejected_without_feeding() {
        let store = MemoryStore::new();
        let mut feed = store.take_command_feed().unwrap();
        store
            .submit_command("bad", json!({"device": "D2000", "value": "lots"}))
            .await
            .unwrap();

        assert!(feed.try_recv().is_err());
        let document = store
            .document(&DocumentPath::new(COMMAND_QUEUE_COLLECTION, "bad"))
            .await
            .unwrap();
        assert_eq!(document["status"], json!("rejected"));
    }

    #[tokio::test]
    async fn snapshot_round_trip_requeues_pending_commands() {
        let path = std::env::temp_dir().join(format!("plclink-store-{}.json", std::process::id()));
        let _ = tokio::fs::remove_file(&path).await;

        {
            let store = MemoryStore::open(&path).await.unwrap();
            store
                .commit(vec![StoreUpdate::new(live("005")).set("devices.D0", 9)])
                .await
                .unwrap();
            store
                .submit_command("done", json!({"targetStation": 1, "targetAddress": "D1", "value": 1}))
                .await
                .unwrap();
            store
                .mark_command("done", CommandDisposition::Processed)
                .await
                .unwrap();
            store
                .submit_command("open", json!({"targetStation": 1, "targetAddress": "D2", "value": 2}))
                .await
                .unwrap();
        }

        let reopened = MemoryStore::open(&path).await.unwrap();
        let document = reopened.document(&live("005")).await.unwrap();
        assert_eq!(document["devices"]["D0"], json!(9));

        let mut feed = reopened.take_command_feed().unwrap();
        let request = feed.try_recv().unwrap();
        assert_eq!(request.command_id, "open");
        assert!(feed.try_recv().is_err());

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn snapshot_keys_outside_the_queue_are_not_commands() {
        let path =
            std::env::temp_dir().join(format!("plclink-keys-{}.json", std::process::id()));
        let snapshot = json!({
            "command_queue/c1": {"targetStation": 2, "targetAddress": "D5", "value": 3, "status": "pending"},
            "live_data/002": {"targetStation": 2, "targetAddress": "D5", "value": 3, "status": "pending"},
            "no-separator": {"status": "pending"},
        });
        tokio::fs::write(&path, serde_json::to_vec(&snapshot).unwrap())
            .await
            .unwrap();

        let store = MemoryStore::open(&path).await.unwrap();
        let mut feed = store.take_command_feed().unwrap();

        assert_eq!(feed.try_recv().unwrap().command_id, "c1");
        assert!(feed.try_recv().is_err());
        let _ = tokio::fs::remove_file(&path).await;
    }
}
