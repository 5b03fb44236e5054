//! Typed request payloads.
//!
//! Each request family decodes its payload [`Value`] into one of these
//! structs with [`from_value`](crate::from_value). Field names are camelCase
//! on the wire.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::Resource;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cache class of a table or record cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheClass {
    /// Cleared when the last subscriber leaves, and at engine start.
    Temporary,
    /// Survives across sessions.
    #[default]
    Persistent,
}

impl CacheClass {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheClass::Temporary => "temporary",
            CacheClass::Persistent => "persistent",
        }
    }

    fn temporary() -> Self {
        CacheClass::Temporary
    }
}

impl fmt::Display for CacheClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of an incremental change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// A new row.
    Insert,
    /// A changed row.
    Update,
    /// A removed row.
    Delete,
}

impl ChangeAction {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Insert => "insert",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }
}

impl FromStr for ChangeAction {
    type Err = ProtocolError;

    /// Accepts both the lowercase incremental names and the uppercase live
    /// feed actions (`CREATE`, `UPDATE`, `DELETE`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" | "create" => Ok(ChangeAction::Insert),
            "update" => Ok(ChangeAction::Update),
            "delete" => Ok(ChangeAction::Delete),
            other => Err(ProtocolError::invalid(format!(
                "unknown change action: {other}"
            ))),
        }
    }
}

/// `connect` and `authenticate` token material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatePayload {
    /// Access token.
    pub token: String,
    /// Refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Expiry of the access token (Unix millis).
    #[serde(default)]
    pub token_expires_at: Option<i64>,
    /// Tenant the token belongs to.
    #[serde(default)]
    pub tenant_code: Option<String>,
}

/// `query` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPayload {
    /// Query text.
    #[serde(alias = "query")]
    pub sql: String,
    /// Bound variables.
    #[serde(default)]
    pub vars: Value,
    /// Explicit query descriptor, overriding table extraction.
    #[serde(default)]
    pub descriptor: Option<Value>,
}

/// `mutate` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutatePayload {
    /// Mutation text.
    #[serde(alias = "query")]
    pub sql: String,
    /// Bound variables.
    #[serde(default)]
    pub vars: Value,
    /// Queue the mutation when the engine is offline instead of failing.
    #[serde(default)]
    pub queue_offline: bool,
}

/// `create`, `select`, `update`, `merge` and `delete` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrudPayload {
    /// Table name, `table:key` string, or tagged record reference.
    pub thing: Value,
    /// Record content for writes.
    #[serde(default)]
    pub data: Option<Value>,
}

impl CrudPayload {
    /// Decodes the target resource.
    pub fn resource(&self) -> ProtocolResult<Resource> {
        Resource::from_value(&self.thing)
    }
}

/// `live` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivePayload {
    /// Live query text.
    #[serde(alias = "sql")]
    pub query: String,
    /// Bound variables.
    #[serde(default)]
    pub vars: Value,
}

/// `kill` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillPayload {
    /// Subscription id returned by `live`.
    #[serde(alias = "queryUuid")]
    pub id: String,
}

/// `subscribe_page_data` and `unsubscribe_page_data` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDataPayload {
    /// Tables the page shows.
    pub tables: Vec<String>,
    /// Cache class of the page's entries.
    #[serde(default = "CacheClass::temporary")]
    pub cache_type: CacheClass,
    /// Case the page belongs to.
    #[serde(default)]
    pub case_id: Option<String>,
    /// User the page belongs to (defaults to the authenticated user).
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Table-level cache payload: `query_cached_data`, `clear_table_cache`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCachePayload {
    /// Table name.
    pub table: String,
    /// Cache class to restrict to.
    #[serde(default)]
    pub cache_type: Option<CacheClass>,
    /// User scope.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Case scope.
    #[serde(default)]
    pub case_id: Option<String>,
}

/// `update_cached_data` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCachePayload {
    /// Table name.
    pub table: String,
    /// Rows to cache, replacing the previous entry.
    #[serde(default)]
    pub data: Vec<Value>,
    /// Cache class of the entry.
    #[serde(default)]
    pub cache_type: CacheClass,
    /// User scope.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Case scope.
    #[serde(default)]
    pub case_id: Option<String>,
}

/// `cache_record` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecordPayload {
    /// Table name.
    pub table: String,
    /// Record key within the table.
    pub record_id: String,
    /// Record content.
    pub data: Value,
    /// Cache class of the entry.
    #[serde(default)]
    pub cache_type: CacheClass,
}

/// `get_cached_record` and `clear_cached_record` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordKeyPayload {
    /// Table name.
    pub table: String,
    /// Record key within the table.
    pub record_id: String,
}

/// Personal-data payload: `sync_user_personal_data`,
/// `get_user_personal_data`, `clear_user_personal_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalDataPayload {
    /// User the document belongs to (defaults to the authenticated user).
    #[serde(default)]
    pub user_id: Option<String>,
    /// Case the document belongs to.
    #[serde(default)]
    pub case_id: Option<String>,
    /// Components to merge, keyed by component name.
    #[serde(default, alias = "personalData")]
    pub data: Option<Value>,
}

/// `process_incremental_update` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalPayload {
    /// Table the change applies to.
    pub table: String,
    /// Kind of change.
    pub action: ChangeAction,
    /// Changed row. Must carry an `id` unless `recordId` is given.
    #[serde(default)]
    pub data: Value,
    /// Key of the changed row.
    #[serde(default)]
    pub record_id: Option<String>,
    /// Conflict strategy: `local`, `remote` or `timestamp`.
    #[serde(default)]
    pub strategy: Option<String>,
    /// User scope of the cached rows.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Case scope of the cached rows.
    #[serde(default)]
    pub case_id: Option<String>,
}

/// Sync cursor payload: `create_sync_record`, `get_sync_record`,
/// `update_sync_record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecordPayload {
    /// Table the cursor tracks.
    pub table: String,
    /// User scope (defaults to the authenticated user).
    #[serde(default)]
    pub user_id: Option<String>,
    /// Case scope.
    #[serde(default)]
    pub case_id: Option<String>,
    /// Last synchronized point (Unix millis).
    #[serde(default)]
    pub last_sync_timestamp: Option<i64>,
    /// Id of the last synchronized row.
    #[serde(default)]
    pub last_sync_id: Option<String>,
    /// Cursor status.
    #[serde(default)]
    pub status: Option<String>,
    /// Retry counter.
    #[serde(default)]
    pub retry_count: Option<u32>,
}

/// `update_sync_status` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusPayload {
    /// Table the cursor tracks.
    pub table: String,
    /// User scope.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Case scope.
    #[serde(default)]
    pub case_id: Option<String>,
    /// New status.
    pub status: String,
    /// Error to record with a failed status.
    #[serde(default)]
    pub error: Option<String>,
}

/// `clear_sync_records` payload. Absent fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncScopePayload {
    /// Restrict to one table.
    #[serde(default)]
    pub table: Option<String>,
    /// Restrict to one user.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Restrict to one case.
    #[serde(default)]
    pub case_id: Option<String>,
}

/// Offline queue payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineQueuePayload {
    /// Queue key.
    pub sync_key: String,
    /// Queue content for `persist_offline_queue`.
    #[serde(default)]
    pub queue: Vec<Value>,
}
