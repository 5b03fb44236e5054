//! Durable offline mutation queues.
//!
//! A queue is whatever array was last written for a sync key. Ordering and
//! retry live with the caller.

use crate::error::EngineResult;
use crate::now_millis;
use casesync_protocol::Value;
use casesync_store::LocalStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Store table holding one record per sync key.
pub const OFFLINE_QUEUE_TABLE: &str = "_offline_queue";

#[derive(Debug, Serialize, Deserialize)]
struct QueueDoc {
    sync_key: String,
    items: Vec<Value>,
    updated_at: i64,
}

/// Persists queues keyed by sync key.
#[derive(Debug, Clone)]
pub struct OfflineQueue {
    store: Arc<LocalStore>,
}

impl OfflineQueue {
    /// Creates a queue over the local store.
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// Replaces the queue stored under `sync_key`.
    pub fn persist(&self, sync_key: &str, items: &[Value]) -> EngineResult<()> {
        let doc = QueueDoc {
            sync_key: sync_key.to_string(),
            items: items.to_vec(),
            updated_at: now_millis(),
        };
        self.store.put_as(OFFLINE_QUEUE_TABLE, sync_key, &doc)?;
        Ok(())
    }

    /// Returns the queue stored under `sync_key`, or an empty one.
    pub fn restore(&self, sync_key: &str) -> EngineResult<Vec<Value>> {
        Ok(self
            .store
            .get_as::<QueueDoc>(OFFLINE_QUEUE_TABLE, sync_key)?
            .map(|doc| doc.items)
            .unwrap_or_default())
    }

    /// Deletes the queue stored under `sync_key`.
    pub fn clear(&self, sync_key: &str) -> EngineResult<()> {
        self.store.delete(OFFLINE_QUEUE_TABLE, sync_key)?;
        Ok(())
    }

    /// Appends one item and returns the queue length.
    pub fn push(&self, sync_key: &str, item: Value) -> EngineResult<usize> {
        let mut items = self.restore(sync_key)?;
        items.push(item);
        self.persist(sync_key, &items)?;
        Ok(items.len())
    }

    /// Returns every sync key with a stored queue.
    pub fn keys(&self) -> Vec<String> {
        self.store
            .select_all(OFFLINE_QUEUE_TABLE)
            .iter()
            .filter_map(|doc| doc.get("sync_key").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }
}
