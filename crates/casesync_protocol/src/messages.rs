//! Message envelopes exchanged between client tabs and the engine.

use crate::error::{ProtocolError, ProtocolResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An inbound request from a client tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Request type, e.g. `query` or `subscribe_page_data`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Request payload (tagged references already decoded).
    #[serde(default)]
    pub payload: Value,
    /// Correlation id echoed back on the response.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Identifier of the originating client tab.
    #[serde(default)]
    pub origin_id: Option<String>,
}

impl Request {
    /// Creates a request.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            correlation_id: None,
            origin_id: None,
        }
    }

    /// Sets the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Sets the origin client id.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin_id = Some(origin.into());
        self
    }

    /// Decodes a request from wire JSON text.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parses the request type.
    pub fn request_kind(&self) -> ProtocolResult<RequestKind> {
        self.kind.parse()
    }
}

/// Every request type the engine handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    // Connection
    /// Establish or reconfigure the remote connection.
    Connect,
    /// Store a token and authenticate the session.
    Authenticate,
    /// Drop the session's authentication.
    Invalidate,
    /// Tear down and re-establish the connection.
    ForceReconnect,
    /// Report the connection state.
    GetConnectionState,
    // Data
    /// Run a query through the router.
    Query,
    /// Run a mutation remotely.
    Mutate,
    /// Create a record.
    Create,
    /// Select a table or record.
    Select,
    /// Replace a record.
    Update,
    /// Merge fields into a record.
    Merge,
    /// Delete a table's records or one record.
    Delete,
    // Live
    /// Open a live subscription.
    Live,
    /// Close a live subscription.
    Kill,
    // Token
    /// Report whether a tenant code is present.
    CheckTenantCode,
    /// Return the persisted token.
    RecoverTokens,
    // Cache
    /// Register a page's interest in tables.
    SubscribePageData,
    /// Drop a page's interest in tables.
    UnsubscribePageData,
    /// Read cached rows.
    QueryCachedData,
    /// Write cached rows.
    UpdateCachedData,
    /// Clear one table cache.
    ClearTableCache,
    /// Clear every cache entry.
    ClearAllCache,
    /// Cache a single record.
    CacheRecord,
    /// Read a single cached record.
    GetCachedRecord,
    /// Remove a single cached record.
    ClearCachedRecord,
    // Personal data
    /// Merge personal-data components.
    SyncUserPersonalData,
    /// Read the personal-data document.
    GetUserPersonalData,
    /// Remove the personal-data document.
    ClearUserPersonalData,
    // Sync
    /// Apply an incremental change to cached rows.
    ProcessIncrementalUpdate,
    /// Create a sync cursor.
    CreateSyncRecord,
    /// Read a sync cursor.
    GetSyncRecord,
    /// Update a sync cursor.
    UpdateSyncRecord,
    /// Update a sync cursor's status.
    UpdateSyncStatus,
    /// Remove sync cursors.
    ClearSyncRecords,
    // Offline queue
    /// Persist an offline queue.
    PersistOfflineQueue,
    /// Read an offline queue back.
    RestoreOfflineQueue,
    /// Remove an offline queue.
    ClearOfflineQueue,
}

const KINDS: &[(&str, RequestKind)] = &[
    ("connect", RequestKind::Connect),
    ("authenticate", RequestKind::Authenticate),
    ("invalidate", RequestKind::Invalidate),
    ("force_reconnect", RequestKind::ForceReconnect),
    ("get_connection_state", RequestKind::GetConnectionState),
    ("query", RequestKind::Query),
    ("mutate", RequestKind::Mutate),
    ("create", RequestKind::Create),
    ("select", RequestKind::Select),
    ("update", RequestKind::Update),
    ("merge", RequestKind::Merge),
    ("delete", RequestKind::Delete),
    ("live", RequestKind::Live),
    ("kill", RequestKind::Kill),
    ("check_tenant_code", RequestKind::CheckTenantCode),
    ("recover_tokens", RequestKind::RecoverTokens),
    ("subscribe_page_data", RequestKind::SubscribePageData),
    ("unsubscribe_page_data", RequestKind::UnsubscribePageData),
    ("query_cached_data", RequestKind::QueryCachedData),
    ("update_cached_data", RequestKind::UpdateCachedData),
    ("clear_table_cache", RequestKind::ClearTableCache),
    ("clear_all_cache", RequestKind::ClearAllCache),
    ("cache_record", RequestKind::CacheRecord),
    ("get_cached_record", RequestKind::GetCachedRecord),
    ("clear_cached_record", RequestKind::ClearCachedRecord),
    ("sync_user_personal_data", RequestKind::SyncUserPersonalData),
    ("get_user_personal_data", RequestKind::GetUserPersonalData),
    ("clear_user_personal_data", RequestKind::ClearUserPersonalData),
    ("process_incremental_update", RequestKind::ProcessIncrementalUpdate),
    ("create_sync_record", RequestKind::CreateSyncRecord),
    ("get_sync_record", RequestKind::GetSyncRecord),
    ("update_sync_record", RequestKind::UpdateSyncRecord),
    ("update_sync_status", RequestKind::UpdateSyncStatus),
    ("clear_sync_records", RequestKind::ClearSyncRecords),
    ("persist_offline_queue", RequestKind::PersistOfflineQueue),
    ("restore_offline_queue", RequestKind::RestoreOfflineQueue),
    ("clear_offline_queue", RequestKind::ClearOfflineQueue),
];

impl RequestKind {
    /// Returns the wire name of the request type.
    pub fn as_str(&self) -> &'static str {
        KINDS
            .iter()
            .find(|(_, kind)| kind == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    /// Returns true for requests that need a live remote connection first.
    pub fn needs_connection(&self) -> bool {
        matches!(
            self,
            RequestKind::Query
                | RequestKind::Mutate
                | RequestKind::Create
                | RequestKind::Select
                | RequestKind::Update
                | RequestKind::Merge
                | RequestKind::Delete
                | RequestKind::Live
        )
    }

    /// Returns every request kind.
    pub fn all() -> impl Iterator<Item = RequestKind> {
        KINDS.iter().map(|(_, kind)| *kind)
    }
}

impl FromStr for RequestKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KINDS
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| ProtocolError::UnknownMessageType(s.to_string()))
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a response reports success or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// The request succeeded.
    Ok,
    /// The request failed.
    Error,
}

/// A response posted back to the originating client only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// `<type>_response` or `<type>_error`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlation id copied from the request.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Result or error payload.
    #[serde(default)]
    pub payload: Value,
}

impl Response {
    /// Creates a success response for a request type.
    pub fn ok(request_type: &str, correlation_id: Option<String>, payload: Value) -> Self {
        Self {
            kind: format!("{request_type}_response"),
            correlation_id,
            payload,
        }
    }

    /// Creates an error response for a request type.
    ///
    /// The payload carries `message` and the error `class`.
    pub fn error(
        request_type: &str,
        correlation_id: Option<String>,
        message: impl Into<String>,
        class: &str,
    ) -> Self {
        Self {
            kind: format!("{request_type}_error"),
            correlation_id,
            payload: Value::object([
                ("message", Value::String(message.into())),
                ("class", Value::from(class)),
            ]),
        }
    }

    /// Returns the response status.
    pub fn status(&self) -> ResponseStatus {
        if self.kind.ends_with("_error") {
            ResponseStatus::Error
        } else {
            ResponseStatus::Ok
        }
    }

    /// Returns true for success responses.
    pub fn is_ok(&self) -> bool {
        self.status() == ResponseStatus::Ok
    }

    /// Returns the error message of an error response.
    pub fn error_message(&self) -> Option<&str> {
        match self.status() {
            ResponseStatus::Error => self.payload.get("message").and_then(Value::as_str),
            ResponseStatus::Ok => None,
        }
    }
}

/// Broadcast-only events. They carry no correlation id.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The connection state machine moved to a new state.
    ConnectionStateChanged {
        /// New state name.
        state: String,
        /// Previous state name.
        previous: String,
        /// Error that caused the transition, if any.
        error: Option<String>,
    },
    /// The authenticated identity changed.
    AuthStateChanged {
        /// Whether the session is authenticated.
        authenticated: bool,
        /// Authenticated user, if any.
        user_id: Option<String>,
    },
    /// Auth state and token were cleared.
    AuthStateCleared {
        /// Why the state was cleared.
        reason: String,
    },
    /// The stored token has no tenant code.
    TenantCodeMissing,
    /// A live feed delivered a change.
    LiveUpdate {
        /// Subscription id as known to clients.
        id: String,
        /// Change action (`CREATE`, `UPDATE`, `DELETE`, `CLOSE`).
        action: String,
        /// Changed record.
        result: Value,
    },
    /// A live subscription was re-established under a new id.
    LiveQueryUuidChanged {
        /// Id the client was using.
        old_id: String,
        /// Id to use from now on.
        new_id: String,
    },
    /// A live subscription could not be re-established.
    LiveQueryResubscribeFailed {
        /// Subscription id.
        id: String,
        /// Failure message.
        error: String,
    },
    /// The access token was refreshed.
    TokenRefreshed {
        /// Expiry of the new token (Unix millis).
        token_expires_at: Option<i64>,
    },
    /// An incremental change was applied to cached rows.
    IncrementalUpdateProcessed {
        /// Table the change applied to.
        table: String,
        /// Key of the changed record.
        id: String,
        /// Resolution outcome.
        outcome: String,
    },
}

impl Event {
    /// Returns the wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::ConnectionStateChanged { .. } => "connection_state_changed",
            Event::AuthStateChanged { .. } => "auth_state_changed",
            Event::AuthStateCleared { .. } => "auth_state_cleared",
            Event::TenantCodeMissing => "tenant_code_missing",
            Event::LiveUpdate { .. } => "live_update",
            Event::LiveQueryUuidChanged { .. } => "live_query_uuid_changed",
            Event::LiveQueryResubscribeFailed { .. } => "live_query_resubscribe_failed",
            Event::TokenRefreshed { .. } => "token_refreshed",
            Event::IncrementalUpdateProcessed { .. } => "incremental_update_processed",
        }
    }

    /// Returns the event payload.
    pub fn payload(&self) -> Value {
        match self {
            Event::ConnectionStateChanged {
                state,
                previous,
                error,
            } => Value::object([
                ("state", Value::from(state.as_str())),
                ("previous", Value::from(previous.as_str())),
                ("error", Value::from(error.clone())),
            ]),
            Event::AuthStateChanged {
                authenticated,
                user_id,
            } => Value::object([
                ("authenticated", Value::Bool(*authenticated)),
                ("userId", Value::from(user_id.clone())),
            ]),
            Event::AuthStateCleared { reason } => {
                Value::object([("reason", Value::from(reason.as_str()))])
            }
            Event::TenantCodeMissing => Value::empty_object(),
            Event::LiveUpdate { id, action, result } => Value::object([
                ("id", Value::from(id.as_str())),
                ("action", Value::from(action.as_str())),
                ("result", result.clone()),
            ]),
            Event::LiveQueryUuidChanged { old_id, new_id } => Value::object([
                ("oldId", Value::from(old_id.as_str())),
                ("newId", Value::from(new_id.as_str())),
            ]),
            Event::LiveQueryResubscribeFailed { id, error } => Value::object([
                ("id", Value::from(id.as_str())),
                ("error", Value::from(error.as_str())),
            ]),
            Event::TokenRefreshed { token_expires_at } => {
                Value::object([("tokenExpiresAt", Value::from(*token_expires_at))])
            }
            Event::IncrementalUpdateProcessed { table, id, outcome } => Value::object([
                ("table", Value::from(table.as_str())),
                ("id", Value::from(id.as_str())),
                ("outcome", Value::from(outcome.as_str())),
            ]),
        }
    }
}

/// A message the engine posts to a client: a correlated response or an event.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Response to one of the client's requests.
    Response(Response),
    /// Broadcast event.
    Event(Event),
}

impl OutboundMessage {
    /// Encodes the message as wire JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            OutboundMessage::Response(response) => {
                let mut map = serde_json::Map::new();
                map.insert("type".into(), response.kind.clone().into());
                map.insert(
                    "correlationId".into(),
                    response
                        .correlation_id
                        .clone()
                        .map(serde_json::Value::String)
                        .unwrap_or(serde_json::Value::Null),
                );
                map.insert("payload".into(), response.payload.to_json());
                serde_json::Value::Object(map)
            }
            OutboundMessage::Event(event) => {
                let mut map = serde_json::Map::new();
                map.insert("type".into(), event.name().into());
                map.insert("payload".into(), event.payload().to_json());
                serde_json::Value::Object(map)
            }
        }
    }

    /// Returns the wire type of the message.
    pub fn kind(&self) -> &str {
        match self {
            OutboundMessage::Response(response) => &response.kind,
            OutboundMessage::Event(event) => event.name(),
        }
    }
}

impl From<Response> for OutboundMessage {
    fn from(response: Response) -> Self {
        OutboundMessage::Response(response)
    }
}

impl From<Event> for OutboundMessage {
    fn from(event: Event) -> Self {
        OutboundMessage::Event(event)
    }
}
