//! Cached tables, records, personal data and sync cursors.
//!
//! Everything lives in the local store under reserved `_`-prefixed tables,
//! so it survives restarts. Writes go straight to the store; a read after a
//! write for the same key sees the write.

use crate::error::{EngineError, EngineResult};
use crate::incremental::{
    apply_to_rows, row_key, ConflictStrategy, IncrementalUpdate, UpdateOutcome,
};
use crate::now_millis;
use casesync_protocol::{from_value, CacheClass, RecordId, Value};
use casesync_store::LocalStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Store table of cached table rows.
pub const TABLE_CACHE: &str = "_cache_table";
/// Store table of cached single records.
pub const RECORD_CACHE: &str = "_cache_record";
/// Store table of personal-data documents.
pub const PERSONAL_DATA: &str = "_personal_data";
/// Store table of sync cursors.
pub const SYNC_RECORDS: &str = "_sync_record";

/// Personal-data component names.
pub const COMPONENTS: [&str; 4] = ["operations", "menus", "global_roles", "case_roles"];

/// User and case a cache entry belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheScope {
    /// Owning user, for private tables.
    pub user_id: Option<String>,
    /// Owning case, for case-scoped tables.
    pub case_id: Option<String>,
}

impl CacheScope {
    /// The shared scope.
    pub fn global() -> Self {
        Self::default()
    }

    /// Creates a scope.
    pub fn new(user_id: Option<String>, case_id: Option<String>) -> Self {
        Self { user_id, case_id }
    }

    fn key(&self, table: &str) -> String {
        format!(
            "{table}|{}|{}",
            self.user_id.as_deref().unwrap_or_default(),
            self.case_id.as_deref().unwrap_or_default()
        )
    }
}

/// A cached table for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCacheDoc {
    /// Table name.
    pub table: String,
    /// Cache class.
    pub cache_type: CacheClass,
    /// Owning user.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Owning case.
    #[serde(default)]
    pub case_id: Option<String>,
    /// Cached rows.
    pub rows: Vec<Value>,
    /// Last write, Unix millis.
    pub updated_at: i64,
}

impl TableCacheDoc {
    /// Returns the scope of the entry.
    pub fn scope(&self) -> CacheScope {
        CacheScope::new(self.user_id.clone(), self.case_id.clone())
    }
}

/// A cached single record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordCacheDoc {
    /// Table name.
    pub table: String,
    /// Record key.
    pub record_id: String,
    /// Record content.
    pub data: Value,
    /// Cache class.
    pub cache_type: CacheClass,
    /// Last write, Unix millis.
    pub updated_at: i64,
}

/// Merged per-user, per-case permission data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonalData {
    /// Owning user.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Owning case.
    #[serde(default)]
    pub case_id: Option<String>,
    /// Permitted operations.
    #[serde(default)]
    pub operations: Vec<Value>,
    /// Visible menus.
    #[serde(default)]
    pub menus: Vec<Value>,
    /// Roles held everywhere.
    #[serde(default)]
    pub global_roles: Vec<Value>,
    /// Roles held in the case.
    #[serde(default)]
    pub case_roles: Vec<Value>,
    /// Last sync, Unix millis.
    #[serde(default)]
    pub synced_at: i64,
}

impl PersonalData {
    /// Returns a component by name.
    pub fn component(&self, name: &str) -> Option<&[Value]> {
        match name {
            "operations" => Some(&self.operations),
            "menus" => Some(&self.menus),
            "global_roles" | "globalRoles" => Some(&self.global_roles),
            "case_roles" | "caseRoles" => Some(&self.case_roles),
            _ => None,
        }
    }

    fn component_mut(&mut self, name: &str) -> Option<&mut Vec<Value>> {
        match name {
            "operations" => Some(&mut self.operations),
            "menus" => Some(&mut self.menus),
            "global_roles" | "globalRoles" => Some(&mut self.global_roles),
            "case_roles" | "caseRoles" => Some(&mut self.case_roles),
            _ => None,
        }
    }
}

/// Sync cursor status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Never synced.
    #[default]
    Idle,
    /// A sync is running.
    Syncing,
    /// Synced at `last_sync_timestamp`.
    Synced,
    /// Cached rows are known to be out of date.
    Stale,
    /// The last sync failed.
    Failed,
}

impl SyncStatus {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Stale => "stale",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "idle" => Ok(SyncStatus::Idle),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" | "success" => Ok(SyncStatus::Synced),
            "stale" => Ok(SyncStatus::Stale),
            "failed" | "error" => Ok(SyncStatus::Failed),
            other => Err(EngineError::invalid(format!("unknown sync status: {other}"))),
        }
    }
}

/// Per (table, user, case) sync cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Table name.
    pub table: String,
    /// Owning user.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Owning case.
    #[serde(default)]
    pub case_id: Option<String>,
    /// Last successful sync, Unix millis.
    #[serde(default)]
    pub last_sync_timestamp: Option<i64>,
    /// Id of the last synced change.
    #[serde(default)]
    pub last_sync_id: Option<String>,
    /// Status.
    #[serde(default)]
    pub status: SyncStatus,
    /// Consecutive failures.
    #[serde(default)]
    pub retry_count: u32,
    /// Last failure message.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Creation time, Unix millis.
    pub created_at: i64,
    /// Last write, Unix millis.
    pub updated_at: i64,
}

/// Fields to change on a sync record. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRecordUpdate {
    /// New last sync time.
    pub last_sync_timestamp: Option<i64>,
    /// New last sync id.
    pub last_sync_id: Option<String>,
    /// New status.
    pub status: Option<SyncStatus>,
    /// New retry count.
    pub retry_count: Option<u32>,
}

/// Filter for clearing sync records. `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncFilter {
    /// Table to match.
    pub table: Option<String>,
    /// User to match.
    pub user_id: Option<String>,
    /// Case to match.
    pub case_id: Option<String>,
}

impl SyncFilter {
    fn matches(&self, record: &SyncRecord) -> bool {
        self.table.as_ref().map_or(true, |t| *t == record.table)
            && self
                .user_id
                .as_ref()
                .map_or(true, |u| record.user_id.as_ref() == Some(u))
            && self
                .case_id
                .as_ref()
                .map_or(true, |c| record.case_id.as_ref() == Some(c))
    }
}

/// The data cache over the local store.
#[derive(Debug, Clone)]
pub struct DataCache {
    store: Arc<LocalStore>,
}

impl DataCache {
    /// Creates a cache over the local store.
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    // Tables

    /// Returns the cached entry of a table for a scope.
    pub fn read_table(
        &self,
        table: &str,
        scope: &CacheScope,
    ) -> EngineResult<Option<TableCacheDoc>> {
        Ok(self.store.get_as(TABLE_CACHE, &scope.key(table))?)
    }

    /// Returns the cached rows of a table for a scope, or none.
    pub fn rows(&self, table: &str, scope: &CacheScope) -> EngineResult<Vec<Value>> {
        Ok(self
            .read_table(table, scope)?
            .map(|doc| doc.rows)
            .unwrap_or_default())
    }

    /// Replaces the cached rows of a table for a scope.
    pub fn write_table(
        &self,
        table: &str,
        scope: &CacheScope,
        class: CacheClass,
        rows: Vec<Value>,
    ) -> EngineResult<TableCacheDoc> {
        let doc = TableCacheDoc {
            table: table.to_string(),
            cache_type: class,
            user_id: scope.user_id.clone(),
            case_id: scope.case_id.clone(),
            rows,
            updated_at: now_millis(),
        };
        self.store.put_as(TABLE_CACHE, &scope.key(table), &doc)?;
        Ok(doc)
    }

    /// Returns every cached entry of a table.
    pub fn table_entries(&self, table: &str) -> Vec<TableCacheDoc> {
        self.docs::<TableCacheDoc>(TABLE_CACHE)
            .into_iter()
            .map(|(_, doc)| doc)
            .filter(|doc| doc.table == table)
            .collect()
    }

    /// Replaces rows with matching keys in every cached entry of a table.
    /// Rows with no match are appended to entries without a case scope.
    pub fn upsert_rows(&self, table: &str, rows: &[Value]) -> EngineResult<usize> {
        let mut touched = 0;
        for mut doc in self.table_entries(table) {
            let mut changed = false;
            for row in rows {
                let Some(key) = row_key(row) else { continue };
                match doc
                    .rows
                    .iter()
                    .position(|r| row_key(r).as_deref() == Some(key.as_str()))
                {
                    Some(i) => doc.rows[i] = row.clone(),
                    None if doc.case_id.is_none() => doc.rows.push(row.clone()),
                    None => continue,
                }
                changed = true;
            }
            if changed {
                self.write_table(table, &doc.scope(), doc.cache_type, doc.rows)?;
                touched += 1;
            }
        }
        for row in rows {
            if let Some(key) = row_key(row) {
                if let Some(mut cached) = self.get_record_doc(table, &key)? {
                    cached.data = row.clone();
                    self.put_record_doc(cached)?;
                }
            }
        }
        Ok(touched)
    }

    /// Removes a row from every cached entry of a table.
    pub fn remove_row(&self, table: &str, key: &str) -> EngineResult<usize> {
        let mut touched = 0;
        for mut doc in self.table_entries(table) {
            let before = doc.rows.len();
            doc.rows.retain(|r| row_key(r).as_deref() != Some(key));
            if doc.rows.len() != before {
                self.write_table(table, &doc.scope(), doc.cache_type, doc.rows)?;
                touched += 1;
            }
        }
        self.clear_cached_record(table, key)?;
        Ok(touched)
    }

    /// Removes every cached row of a table.
    pub fn remove_table_rows(&self, table: &str) -> EngineResult<usize> {
        let mut touched = 0;
        for doc in self.table_entries(table) {
            if !doc.rows.is_empty() {
                self.write_table(table, &doc.scope(), doc.cache_type, Vec::new())?;
                touched += 1;
            }
        }
        Ok(touched)
    }

    /// Clears cached entries of a table, optionally only one scope or one
    /// class. Returns the number removed.
    pub fn clear_table(
        &self,
        table: &str,
        scope: Option<&CacheScope>,
        class: Option<CacheClass>,
    ) -> EngineResult<usize> {
        let mut removed = 0;
        for doc in self.table_entries(table) {
            let scope_matches = scope.map_or(true, |s| *s == doc.scope());
            let class_matches = class.map_or(true, |c| c == doc.cache_type);
            if scope_matches && class_matches {
                self.store.delete(TABLE_CACHE, &doc.scope().key(table))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Clears every cached table, record and sync cursor.
    pub fn clear_all(&self) -> EngineResult<usize> {
        let mut removed = 0;
        for table in [TABLE_CACHE, RECORD_CACHE, SYNC_RECORDS] {
            removed += self.store.delete_table(table)?;
        }
        Ok(removed)
    }

    /// Clears every temporary table and record entry.
    pub fn clear_temporary(&self) -> EngineResult<usize> {
        let mut removed = 0;
        for (key, doc) in self.docs::<TableCacheDoc>(TABLE_CACHE) {
            if doc.cache_type == CacheClass::Temporary {
                self.store.delete(TABLE_CACHE, &key)?;
                removed += 1;
            }
        }
        for (key, doc) in self.docs::<RecordCacheDoc>(RECORD_CACHE) {
            if doc.cache_type == CacheClass::Temporary {
                self.store.delete(RECORD_CACHE, &key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Applies an incremental update to the cached rows of one scope,
    /// creating a persistent entry if none exists.
    pub fn apply_incremental(
        &self,
        table: &str,
        scope: &CacheScope,
        update: &IncrementalUpdate,
        strategy: ConflictStrategy,
    ) -> EngineResult<UpdateOutcome> {
        let (class, mut rows) = match self.read_table(table, scope)? {
            Some(doc) => (doc.cache_type, doc.rows),
            None => (CacheClass::Persistent, Vec::new()),
        };
        let mut update = update.clone();
        if let Some(fields) = update.data.as_object_mut() {
            fields
                .entry("id".to_string())
                .or_insert_with(|| Value::Record(RecordId::new(table, update.key.clone())));
        }
        let outcome = apply_to_rows(&mut rows, &update, strategy);
        if outcome.changed() {
            self.write_table(table, scope, class, rows)?;
            match outcome {
                UpdateOutcome::Deleted => {
                    self.clear_cached_record(table, &update.key)?;
                }
                _ => {
                    if let Some(mut cached) = self.get_record_doc(table, &update.key)? {
                        cached.data = update.data.clone();
                        self.put_record_doc(cached)?;
                    }
                }
            }
        }
        Ok(outcome)
    }

    // Records

    /// Caches one record.
    pub fn cache_record(
        &self,
        table: &str,
        record_id: &str,
        data: Value,
        class: CacheClass,
    ) -> EngineResult<RecordCacheDoc> {
        let doc = RecordCacheDoc {
            table: table.to_string(),
            record_id: record_id.to_string(),
            data,
            cache_type: class,
            updated_at: now_millis(),
        };
        self.put_record_doc(doc.clone())?;
        Ok(doc)
    }

    /// Returns a cached record's content.
    pub fn get_cached_record(&self, table: &str, record_id: &str) -> EngineResult<Option<Value>> {
        Ok(self.get_record_doc(table, record_id)?.map(|doc| doc.data))
    }

    /// Removes a cached record. Returns true if it existed.
    pub fn clear_cached_record(&self, table: &str, record_id: &str) -> EngineResult<bool> {
        Ok(self
            .store
            .delete(RECORD_CACHE, &record_key(table, record_id))?
            .is_some())
    }

    fn get_record_doc(
        &self,
        table: &str,
        record_id: &str,
    ) -> EngineResult<Option<RecordCacheDoc>> {
        Ok(self.store.get_as(RECORD_CACHE, &record_key(table, record_id))?)
    }

    fn put_record_doc(&self, mut doc: RecordCacheDoc) -> EngineResult<()> {
        doc.updated_at = now_millis();
        let key = record_key(&doc.table, &doc.record_id);
        self.store.put_as(RECORD_CACHE, &key, &doc)?;
        Ok(())
    }

    // Personal data

    /// Merges components into the personal-data document of a user and
    /// case, stamping a fresh `synced_at`. Components absent from `patch`
    /// are kept.
    pub fn sync_personal_data(
        &self,
        user_id: Option<&str>,
        case_id: Option<&str>,
        patch: &Value,
    ) -> EngineResult<PersonalData> {
        let mut doc = self
            .get_personal_data(user_id, case_id)?
            .unwrap_or_else(|| PersonalData {
                user_id: user_id.map(str::to_string),
                case_id: case_id.map(str::to_string),
                ..PersonalData::default()
            });
        if let Some(fields) = patch.as_object() {
            for (name, value) in fields {
                if let Some(component) = doc.component_mut(name) {
                    *component = match value {
                        Value::Array(items) => items.clone(),
                        Value::Null => Vec::new(),
                        other => vec![other.clone()],
                    };
                }
            }
        }
        doc.synced_at = now_millis();
        self.store
            .put_as(PERSONAL_DATA, &personal_key(user_id, case_id), &doc)?;
        Ok(doc)
    }

    /// Returns the personal-data document of a user and case.
    pub fn get_personal_data(
        &self,
        user_id: Option<&str>,
        case_id: Option<&str>,
    ) -> EngineResult<Option<PersonalData>> {
        Ok(self
            .store
            .get_as(PERSONAL_DATA, &personal_key(user_id, case_id))?)
    }

    /// Removes personal data. Without a user, every document is removed;
    /// without a case, every document of the user.
    pub fn clear_personal_data(
        &self,
        user_id: Option<&str>,
        case_id: Option<&str>,
    ) -> EngineResult<usize> {
        let mut removed = 0;
        for (key, doc) in self.docs::<PersonalData>(PERSONAL_DATA) {
            let user_matches = user_id.map_or(true, |u| doc.user_id.as_deref() == Some(u));
            let case_matches = case_id.map_or(true, |c| doc.case_id.as_deref() == Some(c));
            if user_matches && case_matches {
                self.store.delete(PERSONAL_DATA, &key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    // Sync records

    /// Creates an idle sync record, or returns the existing one.
    pub fn create_sync_record(&self, table: &str, scope: &CacheScope) -> EngineResult<SyncRecord> {
        if let Some(existing) = self.get_sync_record(table, scope)? {
            return Ok(existing);
        }
        let now = now_millis();
        let record = SyncRecord {
            table: table.to_string(),
            user_id: scope.user_id.clone(),
            case_id: scope.case_id.clone(),
            last_sync_timestamp: None,
            last_sync_id: None,
            status: SyncStatus::Idle,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.put_sync_record(&record)?;
        Ok(record)
    }

    /// Returns a sync record.
    pub fn get_sync_record(
        &self,
        table: &str,
        scope: &CacheScope,
    ) -> EngineResult<Option<SyncRecord>> {
        Ok(self.store.get_as(SYNC_RECORDS, &scope.key(table))?)
    }

    /// Updates fields of a sync record, creating it if absent.
    pub fn update_sync_record(
        &self,
        table: &str,
        scope: &CacheScope,
        update: SyncRecordUpdate,
    ) -> EngineResult<SyncRecord> {
        let mut record = self.create_sync_record(table, scope)?;
        if let Some(ts) = update.last_sync_timestamp {
            record.last_sync_timestamp = Some(ts);
        }
        if let Some(id) = update.last_sync_id {
            record.last_sync_id = Some(id);
        }
        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(retries) = update.retry_count {
            record.retry_count = retries;
        }
        record.updated_at = now_millis();
        self.put_sync_record(&record)?;
        Ok(record)
    }

    /// Sets a sync record's status. `Synced` stamps the sync time and resets
    /// the retry count; `Failed` increments it and keeps the error.
    pub fn update_sync_status(
        &self,
        table: &str,
        scope: &CacheScope,
        status: SyncStatus,
        error: Option<String>,
    ) -> EngineResult<SyncRecord> {
        let mut record = self.create_sync_record(table, scope)?;
        let now = now_millis();
        record.status = status;
        match status {
            SyncStatus::Synced => {
                record.last_sync_timestamp = Some(now);
                record.retry_count = 0;
                record.last_error = None;
            }
            SyncStatus::Failed => {
                record.retry_count = record.retry_count.saturating_add(1);
                record.last_error = error;
            }
            _ => {}
        }
        record.updated_at = now;
        self.put_sync_record(&record)?;
        Ok(record)
    }

    /// Marks every sync record of a table stale.
    pub fn mark_stale(&self, table: &str) -> EngineResult<usize> {
        let mut marked = 0;
        for (_, mut record) in self.docs::<SyncRecord>(SYNC_RECORDS) {
            if record.table == table && record.status != SyncStatus::Stale {
                record.status = SyncStatus::Stale;
                record.updated_at = now_millis();
                self.put_sync_record(&record)?;
                marked += 1;
            }
        }
        Ok(marked)
    }

    /// Removes matching sync records.
    pub fn clear_sync_records(&self, filter: &SyncFilter) -> EngineResult<usize> {
        let mut removed = 0;
        for (key, record) in self.docs::<SyncRecord>(SYNC_RECORDS) {
            if filter.matches(&record) {
                self.store.delete(SYNC_RECORDS, &key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Returns true if the table was synced for the scope within
    /// `stale_after`.
    pub fn is_fresh(&self, table: &str, scope: &CacheScope, stale_after: Duration) -> bool {
        let record = match self.get_sync_record(table, scope) {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                warn!(table, error = %e, "failed to read sync record");
                return false;
            }
        };
        let max_age = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);
        record.status == SyncStatus::Synced
            && record
                .last_sync_timestamp
                .is_some_and(|ts| now_millis().saturating_sub(ts) < max_age)
    }

    fn put_sync_record(&self, record: &SyncRecord) -> EngineResult<()> {
        let scope = CacheScope::new(record.user_id.clone(), record.case_id.clone());
        self.store
            .put_as(SYNC_RECORDS, &scope.key(&record.table), record)?;
        Ok(())
    }

    /// Decodes every document of a reserved table, skipping undecodable ones.
    fn docs<T: DeserializeOwned>(&self, store_table: &str) -> Vec<(String, T)> {
        let mut docs = Vec::new();
        for mut content in self.store.select_all(store_table) {
            let key = match content.as_object_mut().and_then(|f| f.remove("id")) {
                Some(Value::Record(rid)) => rid.id,
                _ => continue,
            };
            match from_value::<T>(&content) {
                Ok(doc) => docs.push((key, doc)),
                Err(e) => warn!(
                    table = store_table,
                    key = %key,
                    error = %e,
                    "skipping undecodable cache document"
                ),
            }
        }
        docs
    }
}

fn record_key(table: &str, record_id: &str) -> String {
    format!("{table}:{record_id}")
}

fn personal_key(user_id: Option<&str>, case_id: Option<&str>) -> String {
    format!(
        "{}|{}",
        user_id.unwrap_or_default(),
        case_id.unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use casesync_protocol::ChangeAction;

    fn cache() -> DataCache {
        DataCache::new(Arc::new(LocalStore::open_in_memory().unwrap()))
    }

    fn row(key: &str, name: &str) -> Value {
        Value::object([
            ("id", Value::Record(RecordId::new("case", key))),
            ("name", Value::from(name)),
        ])
    }

    #[test]
    fn write_then_read_returns_written_rows() {
        let c = cache();
        let scope = CacheScope::global();
        c.write_table("case", &scope, CacheClass::Persistent, vec![row("c1", "A")])
            .unwrap();
        assert_eq!(c.rows("case", &scope).unwrap(), vec![row("c1", "A")]);

        c.write_table("case", &scope, CacheClass::Persistent, vec![row("c2", "B")])
            .unwrap();
        assert_eq!(c.rows("case", &scope).unwrap(), vec![row("c2", "B")]);
    }

    #[test]
    fn scopes_are_separate() {
        let c = cache();
        let u1 = CacheScope::new(Some("u1".into()), None);
        let u2 = CacheScope::new(Some("u2".into()), None);
        c.write_table("note", &u1, CacheClass::Persistent, vec![row("n1", "mine")])
            .unwrap();
        assert!(c.rows("note", &u2).unwrap().is_empty());
        assert_eq!(c.table_entries("note").len(), 1);
    }

    #[test]
    fn upsert_and_remove_rows_across_entries() {
        let c = cache();
        let global = CacheScope::global();
        let case = CacheScope::new(None, Some("c9".into()));
        c.write_table("case", &global, CacheClass::Persistent, vec![row("c1", "A")])
            .unwrap();
        c.write_table("case", &case, CacheClass::Persistent, vec![row("c1", "A")])
            .unwrap();
        c.cache_record("case", "c1", row("c1", "A"), CacheClass::Persistent)
            .unwrap();

        assert_eq!(c.upsert_rows("case", &[row("c1", "A2"), row("c3", "C")]).unwrap(), 2);
        assert_eq!(c.rows("case", &global).unwrap().len(), 2);
        assert_eq!(c.rows("case", &case).unwrap(), vec![row("c1", "A2")]);
        assert_eq!(c.get_cached_record("case", "c1").unwrap(), Some(row("c1", "A2")));

        assert_eq!(c.remove_row("case", "c1").unwrap(), 2);
        assert_eq!(c.rows("case", &global).unwrap(), vec![row("c3", "C")]);
        assert_eq!(c.get_cached_record("case", "c1").unwrap(), None);
    }

    #[test]
    fn clear_temporary_keeps_persistent() {
        let c = cache();
        let scope = CacheScope::global();
        c.write_table("case", &scope, CacheClass::Persistent, vec![row("c1", "A")])
            .unwrap();
        c.write_table("draft", &scope, CacheClass::Temporary, vec![row("d1", "D")])
            .unwrap();
        c.cache_record("draft", "d1", row("d1", "D"), CacheClass::Temporary)
            .unwrap();

        assert_eq!(c.clear_temporary().unwrap(), 2);
        assert!(c.read_table("draft", &scope).unwrap().is_none());
        assert!(c.read_table("case", &scope).unwrap().is_some());
    }

    #[test]
    fn clear_table_by_class() {
        let c = cache();
        let a = CacheScope::new(None, Some("a".into()));
        let b = CacheScope::new(None, Some("b".into()));
        c.write_table("claim", &a, CacheClass::Temporary, vec![]).unwrap();
        c.write_table("claim", &b, CacheClass::Persistent, vec![]).unwrap();
        assert_eq!(
            c.clear_table("claim", None, Some(CacheClass::Temporary)).unwrap(),
            1
        );
        assert_eq!(c.clear_table("claim", None, None).unwrap(), 1);
        assert!(c.table_entries("claim").is_empty());
    }

    #[test]
    fn incremental_update_inserts_into_missing_entry() {
        let c = cache();
        let scope = CacheScope::global();
        let update = IncrementalUpdate::new(
            ChangeAction::Insert,
            "c5",
            Value::object([("name", Value::from("E"))]),
        );
        let outcome = c
            .apply_incremental("case", &scope, &update, ConflictStrategy::Remote)
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Inserted);
        assert_eq!(c.rows("case", &scope).unwrap(), vec![row("c5", "E")]);
    }

    #[test]
    fn personal_data_merges_components() {
        let c = cache();
        let first = Value::object([
            ("operations", Value::Array(vec![Value::from("read")])),
            ("menus", Value::Array(vec![Value::from("home")])),
        ]);
        c.sync_personal_data(Some("u1"), Some("c1"), &first).unwrap();

        let second = Value::object([("caseRoles", Value::Array(vec![Value::from("trustee")]))]);
        let doc = c.sync_personal_data(Some("u1"), Some("c1"), &second).unwrap();
        assert_eq!(doc.operations, vec![Value::from("read")]);
        assert_eq!(doc.case_roles, vec![Value::from("trustee")]);

        assert_eq!(c.clear_personal_data(Some("u1"), None).unwrap(), 1);
        assert!(c.get_personal_data(Some("u1"), Some("c1")).unwrap().is_none());
    }

    #[test]
    fn sync_record_lifecycle() {
        let c = cache();
        let scope = CacheScope::new(Some("u1".into()), None);
        let created = c.create_sync_record("case", &scope).unwrap();
        assert_eq!(created.status, SyncStatus::Idle);
        assert!(!c.is_fresh("case", &scope, Duration::from_secs(60)));

        let failed = c
            .update_sync_status("case", &scope, SyncStatus::Failed, Some("timeout".into()))
            .unwrap();
        assert_eq!(failed.retry_count, 1);

        let synced = c
            .update_sync_status("case", &scope, SyncStatus::Synced, None)
            .unwrap();
        assert_eq!(synced.retry_count, 0);
        assert!(synced.last_sync_timestamp.is_some());
        assert!(c.is_fresh("case", &scope, Duration::from_secs(60)));

        assert_eq!(c.mark_stale("case").unwrap(), 1);
        assert!(!c.is_fresh("case", &scope, Duration::from_secs(60)));

        let updated = c
            .update_sync_record(
                "case",
                &scope,
                SyncRecordUpdate {
                    last_sync_id: Some("chg-9".into()),
                    ..SyncRecordUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.last_sync_id.as_deref(), Some("chg-9"));
        assert_eq!(updated.created_at, created.created_at);
    }

    #[test]
    fn clear_sync_records_by_filter() {
        let c = cache();
        c.create_sync_record("case", &CacheScope::new(Some("u1".into()), None))
            .unwrap();
        c.create_sync_record("case", &CacheScope::new(Some("u2".into()), None))
            .unwrap();
        c.create_sync_record("note", &CacheScope::global()).unwrap();

        let filter = SyncFilter {
            user_id: Some("u1".into()),
            ..SyncFilter::default()
        };
        assert_eq!(c.clear_sync_records(&filter).unwrap(), 1);
        assert_eq!(c.clear_sync_records(&SyncFilter::default()).unwrap(), 2);
    }
}
