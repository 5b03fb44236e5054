//! The local document store.

use crate::backend::LogBackend;
use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::error::{StoreError, StoreResult};
use crate::file::FileLog;
use crate::frame::{self, LogRecord};
use crate::memory::InMemoryLog;
use crate::query::LocalQuery;
use casesync_protocol::{from_value, to_value, RecordId, Resource, Value};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Table = BTreeMap<String, Value>;

/// Store statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of non-empty tables.
    pub tables: usize,
    /// Number of records across all tables.
    pub records: usize,
    /// Current log size in bytes.
    pub log_bytes: u64,
    /// Frames in the log.
    pub frames: u64,
    /// Frames superseded by later writes.
    pub garbage_frames: u64,
    /// Writes since open.
    pub writes: u64,
    /// Compactions since open.
    pub compactions: u64,
}

/// Log sizes before and after a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    /// Log size before.
    pub before_bytes: u64,
    /// Log size after.
    pub after_bytes: u64,
}

struct Inner {
    backend: Box<dyn LogBackend>,
    tables: BTreeMap<String, Table>,
    frames: u64,
    garbage_frames: u64,
    writes: u64,
    compactions: u64,
}

/// A local document store over a record log.
///
/// Reads are served from the in-memory index. Writes append one frame and
/// then update the index, under a single write lock, so concurrent writes to
/// the same key are last-write-wins.
///
/// Every returned record carries `id` as a [`Value::Record`] of its table and
/// key.
pub struct LocalStore {
    inner: RwLock<Inner>,
    config: StoreConfig,
    _dir: Option<StoreDir>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Opens a store over a backend, replaying its log.
    ///
    /// A torn tail left by a crash mid-write is logged and cut off.
    pub fn open(mut backend: Box<dyn LogBackend>, config: StoreConfig) -> StoreResult<Self> {
        let data = backend.read_all()?;
        let replay = frame::scan(&data)?;
        if replay.torn_bytes > 0 {
            warn!(
                valid_bytes = replay.valid_len,
                torn_bytes = replay.torn_bytes,
                "discarding torn tail of store log"
            );
            backend.truncate(replay.valid_len)?;
        }

        let mut inner = Inner {
            backend,
            tables: BTreeMap::new(),
            frames: 0,
            garbage_frames: 0,
            writes: 0,
            compactions: 0,
        };
        for record in replay.records {
            inner.apply(record);
        }
        info!(
            frames = inner.frames,
            tables = inner.tables.len(),
            "replayed store log"
        );

        Ok(Self {
            inner: RwLock::new(inner),
            config,
            _dir: None,
        })
    }

    /// Opens a persistent store in a data directory, taking the directory lock.
    pub fn open_dir(path: &Path, config: StoreConfig) -> StoreResult<Self> {
        let dir = StoreDir::open(path)?;
        let log = FileLog::open(&dir.file_path(&config.log_file))?;
        let mut store = Self::open(Box::new(log), config)?;
        store._dir = Some(dir);
        Ok(store)
    }

    /// Opens an empty in-memory store.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open(Box::new(InMemoryLog::new()), StoreConfig::default())
    }

    /// Creates a record. Without a key, the content's `id` is used, or a
    /// fresh UUID when it has none.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordExists`] if the key is taken.
    pub fn create(&self, table: &str, key: Option<&str>, content: Value) -> StoreResult<Value> {
        let key = match key {
            Some(key) => key.to_string(),
            None => content_key(table, &content).unwrap_or_else(|| Uuid::new_v4().to_string()),
        };
        let mut inner = self.inner.write();
        if inner.get(table, &key).is_some() {
            return Err(StoreError::RecordExists {
                table: table.to_string(),
                key,
            });
        }
        let content = normalize(table, &key, content)?;
        self.write(&mut inner, LogRecord::Put {
            table: table.to_string(),
            key,
            content: content.clone(),
        })?;
        Ok(content)
    }

    /// Selects a whole table or a single record.
    pub fn select(&self, resource: &Resource) -> Vec<Value> {
        let inner = self.inner.read();
        match resource {
            Resource::Table(table) => inner
                .tables
                .get(table)
                .map(|rows| rows.values().cloned().collect())
                .unwrap_or_default(),
            Resource::Record(rid) => inner.get(&rid.tb, &rid.id).cloned().into_iter().collect(),
        }
    }

    /// Returns every record of a table.
    pub fn select_all(&self, table: &str) -> Vec<Value> {
        self.select(&Resource::Table(table.to_string()))
    }

    /// Returns one record.
    pub fn get(&self, table: &str, key: &str) -> Option<Value> {
        self.inner.read().get(table, key).cloned()
    }

    /// Replaces a record, creating it if absent.
    pub fn update(&self, table: &str, key: &str, content: Value) -> StoreResult<Value> {
        let content = normalize(table, key, content)?;
        let mut inner = self.inner.write();
        self.write(&mut inner, LogRecord::Put {
            table: table.to_string(),
            key: key.to_string(),
            content: content.clone(),
        })?;
        Ok(content)
    }

    /// Shallow-merges fields into a record, creating it if absent.
    pub fn merge(&self, table: &str, key: &str, patch: &Value) -> StoreResult<Value> {
        if !matches!(patch, Value::Object(_)) {
            return Err(StoreError::invalid(format!(
                "merge patch must be an object, got {}",
                patch.kind()
            )));
        }
        let mut inner = self.inner.write();
        let mut content = inner
            .get(table, key)
            .cloned()
            .unwrap_or_else(Value::empty_object);
        content.merge(patch);
        let content = normalize(table, key, content)?;
        self.write(&mut inner, LogRecord::Put {
            table: table.to_string(),
            key: key.to_string(),
            content: content.clone(),
        })?;
        Ok(content)
    }

    /// Deletes a record, returning it if it existed.
    pub fn delete(&self, table: &str, key: &str) -> StoreResult<Option<Value>> {
        let mut inner = self.inner.write();
        let Some(previous) = inner.get(table, key).cloned() else {
            return Ok(None);
        };
        self.write(&mut inner, LogRecord::Delete {
            table: table.to_string(),
            key: key.to_string(),
        })?;
        Ok(Some(previous))
    }

    /// Deletes a whole table or a single record, returning the removed count.
    pub fn delete_resource(&self, resource: &Resource) -> StoreResult<usize> {
        match resource {
            Resource::Table(table) => self.delete_table(table),
            Resource::Record(rid) => Ok(self.delete(&rid.tb, &rid.id)?.map_or(0, |_| 1)),
        }
    }

    /// Deletes every record of a table.
    pub fn delete_table(&self, table: &str) -> StoreResult<usize> {
        let mut inner = self.inner.write();
        let count = inner.tables.get(table).map_or(0, BTreeMap::len);
        if count == 0 {
            return Ok(0);
        }
        self.write(&mut inner, LogRecord::DropTable {
            table: table.to_string(),
        })?;
        Ok(count)
    }

    /// Deletes every record of every table.
    pub fn clear(&self) -> StoreResult<()> {
        let mut inner = self.inner.write();
        self.write(&mut inner, LogRecord::Clear)
    }

    /// Runs an in-memory query against a table.
    pub fn query(&self, query: &LocalQuery) -> Vec<Value> {
        let inner = self.inner.read();
        match inner.tables.get(&query.table) {
            Some(rows) => query.apply(rows.values()),
            None => Vec::new(),
        }
    }

    /// Reads a record as a typed value.
    ///
    /// The injected `id` field is removed before decoding.
    pub fn get_as<T: DeserializeOwned>(&self, table: &str, key: &str) -> StoreResult<Option<T>> {
        let Some(mut content) = self.get(table, key) else {
            return Ok(None);
        };
        if let Some(fields) = content.as_object_mut() {
            fields.remove("id");
        }
        from_value(&content)
            .map(Some)
            .map_err(|e| StoreError::codec(format!("{table}:{key}: {e}")))
    }

    /// Writes a typed value as a record, replacing any previous content.
    pub fn put_as<T: Serialize>(&self, table: &str, key: &str, item: &T) -> StoreResult<()> {
        let content = to_value(item).map_err(StoreError::codec)?;
        self.update(table, key, content).map(|_| ())
    }

    /// Returns every non-empty table with its record count.
    pub fn tables(&self) -> Vec<(String, usize)> {
        self.inner
            .read()
            .tables
            .iter()
            .map(|(name, rows)| (name.clone(), rows.len()))
            .collect()
    }

    /// Returns the number of records in a table.
    pub fn len(&self, table: &str) -> usize {
        self.inner.read().tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Returns true if the table has no records.
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Rewrites the log as a snapshot of live records.
    pub fn compact(&self) -> StoreResult<CompactionReport> {
        let mut inner = self.inner.write();
        self.compact_locked(&mut inner)
    }

    /// Makes every write durable.
    pub fn sync(&self) -> StoreResult<()> {
        self.inner.write().backend.sync()
    }

    /// Returns store statistics.
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            tables: inner.tables.len(),
            records: inner.tables.values().map(BTreeMap::len).sum(),
            log_bytes: inner.backend.size().unwrap_or(0),
            frames: inner.frames,
            garbage_frames: inner.garbage_frames,
            writes: inner.writes,
            compactions: inner.compactions,
        }
    }

    fn write(&self, inner: &mut Inner, record: LogRecord) -> StoreResult<()> {
        let frame = record.encode_frame()?;
        inner.backend.append(&frame)?;
        if self.config.sync_on_write {
            inner.backend.sync()?;
        }
        inner.apply(record);
        inner.writes += 1;

        if self.should_compact(inner)? {
            if let Err(err) = self.compact_locked(inner) {
                warn!(error = %err, "store compaction failed");
            }
        }
        Ok(())
    }

    fn should_compact(&self, inner: &Inner) -> StoreResult<bool> {
        if inner.frames == 0 {
            return Ok(false);
        }
        let size = inner.backend.size()?;
        let ratio = inner.garbage_frames as f64 / inner.frames as f64;
        Ok(size >= self.config.compact_threshold_bytes
            && ratio >= self.config.compact_min_garbage_ratio)
    }

    fn compact_locked(&self, inner: &mut Inner) -> StoreResult<CompactionReport> {
        let before_bytes = inner.backend.size()?;
        let mut snapshot = Vec::new();
        let mut frames = 0u64;
        for (table, rows) in &inner.tables {
            for (key, content) in rows {
                let record = LogRecord::Put {
                    table: table.clone(),
                    key: key.clone(),
                    content: content.clone(),
                };
                snapshot.extend(record.encode_frame()?);
                frames += 1;
            }
        }
        inner.backend.replace(&snapshot)?;
        inner.frames = frames;
        inner.garbage_frames = 0;
        inner.compactions += 1;
        let after_bytes = snapshot.len() as u64;
        debug!(before_bytes, after_bytes, frames, "compacted store log");
        Ok(CompactionReport {
            before_bytes,
            after_bytes,
        })
    }
}

impl Inner {
    fn get(&self, table: &str, key: &str) -> Option<&Value> {
        self.tables.get(table).and_then(|rows| rows.get(key))
    }

    /// Applies a record to the index and updates frame accounting.
    fn apply(&mut self, record: LogRecord) {
        self.frames += 1;
        match record {
            LogRecord::Put {
                table,
                key,
                content,
            } => {
                if self
                    .tables
                    .entry(table)
                    .or_default()
                    .insert(key, content)
                    .is_some()
                {
                    self.garbage_frames += 1;
                }
            }
            LogRecord::Delete { table, key } => {
                if let Some(rows) = self.tables.get_mut(&table) {
                    if rows.remove(&key).is_some() {
                        self.garbage_frames += 2;
                    }
                    if rows.is_empty() {
                        self.tables.remove(&table);
                    }
                }
            }
            LogRecord::DropTable { table } => {
                let removed = self.tables.remove(&table).map_or(0, |rows| rows.len());
                self.garbage_frames += removed as u64 + 1;
            }
            LogRecord::Clear => {
                let removed: usize = self.tables.values().map(BTreeMap::len).sum();
                self.tables.clear();
                self.garbage_frames += removed as u64 + 1;
            }
        }
        self.garbage_frames = self.garbage_frames.min(self.frames);
    }
}

/// Checks the content is a document and injects its `id`.
fn normalize(table: &str, key: &str, content: Value) -> StoreResult<Value> {
    if key.is_empty() {
        return Err(StoreError::invalid("record key must not be empty"));
    }
    let mut content = match content {
        Value::Object(_) => content,
        Value::Null => Value::empty_object(),
        other => {
            return Err(StoreError::invalid(format!(
                "record content must be an object, got {}",
                other.kind()
            )))
        }
    };
    content.insert("id", Value::Record(RecordId::new(table, key)));
    Ok(content)
}

/// Extracts a key from the content's `id` field.
fn content_key(table: &str, content: &Value) -> Option<String> {
    match content.get("id")? {
        Value::Record(rid) if rid.tb == table => Some(rid.id.clone()),
        Value::String(s) => match RecordId::parse(s) {
            Some(rid) if rid.tb == table => Some(rid.id),
            Some(_) => None,
            None if !s.is_empty() => Some(s.clone()),
            None => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn doc(name: &str) -> Value {
        Value::object([("name", Value::from(name))])
    }

    #[test]
    fn create_injects_record_id() {
        let store = LocalStore::open_in_memory().unwrap();
        let created = store.create("case", Some("c1"), doc("alpha")).unwrap();
        assert_eq!(
            created.get("id"),
            Some(&Value::Record(RecordId::new("case", "c1")))
        );
        assert_eq!(store.get("case", "c1"), Some(created));
    }

    #[test]
    fn create_without_key_generates_one() {
        let store = LocalStore::open_in_memory().unwrap();
        let created = store.create("case", None, doc("a")).unwrap();
        let rid = created.get("id").and_then(Value::as_record_id).unwrap();
        assert_eq!(rid.tb, "case");
        assert!(Uuid::parse_str(&rid.id).is_ok());
    }

    #[test]
    fn create_uses_content_id() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut content = doc("a");
        content.insert("id", Value::from("case:k9"));
        store.create("case", None, content).unwrap();
        assert!(store.get("case", "k9").is_some());
    }

    #[test]
    fn create_rejects_duplicates() {
        let store = LocalStore::open_in_memory().unwrap();
        store.create("case", Some("c1"), doc("a")).unwrap();
        let err = store.create("case", Some("c1"), doc("b")).unwrap_err();
        assert!(matches!(err, StoreError::RecordExists { .. }));
    }

    #[test]
    fn write_then_read_is_visible() {
        let store = LocalStore::open_in_memory().unwrap();
        store.update("case", "c1", doc("first")).unwrap();
        store.update("case", "c1", doc("second")).unwrap();
        let row = store.get("case", "c1").unwrap();
        assert_eq!(row.get("name").and_then(Value::as_str), Some("second"));
    }

    #[test]
    fn merge_upserts_and_patches() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .merge("case", "c1", &Value::object([("a", Value::from(1i64))]))
            .unwrap();
        let merged = store
            .merge("case", "c1", &Value::object([("b", Value::from(2i64))]))
            .unwrap();
        assert_eq!(merged.get("a").and_then(Value::as_i64), Some(1));
        assert_eq!(merged.get("b").and_then(Value::as_i64), Some(2));
        assert!(store.merge("case", "c1", &Value::from(3i64)).is_err());
    }

    #[test]
    fn non_object_content_is_rejected() {
        let store = LocalStore::open_in_memory().unwrap();
        let err = store.update("case", "c1", Value::from("text")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidContent(_)));
    }

    #[test]
    fn select_table_and_record() {
        let store = LocalStore::open_in_memory().unwrap();
        store.update("case", "a", doc("a")).unwrap();
        store.update("case", "b", doc("b")).unwrap();
        assert_eq!(store.select(&Resource::Table("case".into())).len(), 2);
        assert_eq!(
            store
                .select(&Resource::Record(RecordId::new("case", "b")))
                .len(),
            1
        );
        assert!(store.select(&Resource::Table("other".into())).is_empty());
    }

    #[test]
    fn delete_and_drop_table() {
        let store = LocalStore::open_in_memory().unwrap();
        store.update("case", "a", doc("a")).unwrap();
        store.update("case", "b", doc("b")).unwrap();
        assert!(store.delete("case", "a").unwrap().is_some());
        assert!(store.delete("case", "a").unwrap().is_none());
        assert_eq!(store.delete_table("case").unwrap(), 1);
        assert!(store.is_empty("case"));
        assert!(store.tables().is_empty());
    }

    #[test]
    fn typed_roundtrip() {
        #[derive(Serialize, Deserialize, Debug, PartialEq)]
        struct Cursor {
            table: String,
            retry_count: u32,
        }
        let store = LocalStore::open_in_memory().unwrap();
        let cursor = Cursor {
            table: "case".into(),
            retry_count: 3,
        };
        store.put_as("_sync", "case", &cursor).unwrap();
        assert_eq!(store.get_as::<Cursor>("_sync", "case").unwrap(), Some(cursor));
        assert_eq!(store.get_as::<Cursor>("_sync", "none").unwrap(), None);
    }

    #[test]
    fn reopen_replays_the_log() {
        let log = InMemoryLog::new();
        {
            let store = LocalStore::open(Box::new(log.clone()), StoreConfig::default()).unwrap();
            store.update("case", "a", doc("a")).unwrap();
            store.update("case", "b", doc("b")).unwrap();
            store.delete("case", "a").unwrap();
        }
        let store = LocalStore::open(Box::new(log), StoreConfig::default()).unwrap();
        assert_eq!(store.tables(), vec![("case".to_string(), 1)]);
        assert!(store.get("case", "b").is_some());
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let log = InMemoryLog::new();
        {
            let store = LocalStore::open(Box::new(log.clone()), StoreConfig::default()).unwrap();
            store.update("case", "a", doc("a")).unwrap();
        }
        let good = log.snapshot().len();
        let mut writer = log.clone();
        writer.append(b"CSLG\xFF\x00").unwrap();

        let store = LocalStore::open(Box::new(log.clone()), StoreConfig::default()).unwrap();
        assert!(store.get("case", "a").is_some());
        assert_eq!(log.snapshot().len(), good);
    }

    #[test]
    fn compaction_keeps_live_records() {
        let config = StoreConfig::new()
            .compact_threshold_bytes(u64::MAX)
            .sync_on_write(false);
        let log = InMemoryLog::new();
        let store = LocalStore::open(Box::new(log.clone()), config.clone()).unwrap();
        for i in 0..10i64 {
            store
                .update("case", "a", Value::object([("n", Value::from(i))]))
                .unwrap();
        }
        store.update("case", "b", doc("b")).unwrap();

        let report = store.compact().unwrap();
        assert!(report.after_bytes < report.before_bytes);
        assert_eq!(store.stats().frames, 2);
        assert_eq!(store.stats().garbage_frames, 0);
        drop(store);

        let reopened = LocalStore::open(Box::new(log), config).unwrap();
        let a = reopened.get("case", "a").unwrap();
        assert_eq!(a.get("n").and_then(Value::as_i64), Some(9));
        assert!(reopened.get("case", "b").is_some());
    }

    #[test]
    fn threshold_triggers_automatic_compaction() {
        let config = StoreConfig::new()
            .compact_threshold_bytes(256)
            .compact_min_garbage_ratio(0.5)
            .sync_on_write(false);
        let store = LocalStore::open(Box::new(InMemoryLog::new()), config).unwrap();
        for i in 0..50i64 {
            store
                .update("case", "a", Value::object([("n", Value::from(i))]))
                .unwrap();
        }
        let stats = store.stats();
        assert!(stats.compactions > 0);
        assert!(stats.log_bytes < 50 * 40);
        assert_eq!(stats.writes, 50);
    }

    #[test]
    fn query_filters_rows() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .update("case", "a", Value::object([("status", Value::from("open"))]))
            .unwrap();
        store
            .update("case", "b", Value::object([("status", Value::from("closed"))]))
            .unwrap();
        let open = store.query(&LocalQuery::new("case").filter("status", "open"));
        assert_eq!(open.len(), 1);
        assert!(store.query(&LocalQuery::new("missing")).is_empty());
    }
}
