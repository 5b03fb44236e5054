//! Remote database abstraction.
//!
//! The engine owns exactly one [`RemoteDatabase`] handle. Implementations
//! report transport loss and live notifications through
//! [`RemoteDatabase::subscribe_events`].

use crate::error::EngineResult;
use async_trait::async_trait;
use casesync_protocol::{Resource, Value};
use std::fmt;
use tokio::sync::broadcast;

/// Change action of a live notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiveAction {
    /// A record was created.
    Create,
    /// A record was updated.
    Update,
    /// A record was deleted.
    Delete,
    /// The feed was closed by the server.
    Close,
}

impl LiveAction {
    /// Returns the wire name (`CREATE`, `UPDATE`, `DELETE`, `CLOSE`).
    pub fn as_str(&self) -> &'static str {
        match self {
            LiveAction::Create => "CREATE",
            LiveAction::Update => "UPDATE",
            LiveAction::Delete => "DELETE",
            LiveAction::Close => "CLOSE",
        }
    }

    /// Parses a wire action, case-insensitively.
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_uppercase().as_str() {
            "CREATE" => Some(LiveAction::Create),
            "UPDATE" => Some(LiveAction::Update),
            "DELETE" => Some(LiveAction::Delete),
            "CLOSE" | "KILLED" => Some(LiveAction::Close),
            _ => None,
        }
    }
}

impl fmt::Display for LiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change delivered by a live feed.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveNotification {
    /// Remote-assigned feed id.
    pub live_id: String,
    /// Change action.
    pub action: LiveAction,
    /// The changed record.
    pub result: Value,
}

/// Asynchronous signals from the remote connection.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// A live feed delivered a change.
    Live(LiveNotification),
    /// The transport closed.
    Disconnected {
        /// Close reason.
        reason: String,
    },
}

/// A connection to the remote database service.
///
/// All methods may suspend. Transport failures are reported as
/// connection-class errors; remote rejections as query-class errors.
#[async_trait]
pub trait RemoteDatabase: Send + Sync {
    /// Opens the transport to `endpoint`.
    async fn connect(&self, endpoint: &str) -> EngineResult<()>;

    /// Selects namespace and database.
    async fn use_ns(&self, namespace: &str, database: &str) -> EngineResult<()>;

    /// Authenticates the session with an access token.
    async fn authenticate(&self, token: &str) -> EngineResult<()>;

    /// Drops the session's authentication.
    async fn invalidate(&self) -> EngineResult<()>;

    /// Runs query text. Returns one result per statement.
    async fn query(&self, sql: &str, vars: &Value) -> EngineResult<Vec<Value>>;

    /// Selects a table or a record.
    async fn select(&self, resource: &Resource) -> EngineResult<Value>;

    /// Creates a record.
    async fn create(&self, resource: &Resource, data: Option<Value>) -> EngineResult<Value>;

    /// Replaces a table's records or one record.
    async fn update(&self, resource: &Resource, data: Option<Value>) -> EngineResult<Value>;

    /// Merges data into a table's records or one record.
    async fn merge(&self, resource: &Resource, data: Value) -> EngineResult<Value>;

    /// Deletes a table's records or one record.
    async fn delete(&self, resource: &Resource) -> EngineResult<Value>;

    /// Opens a live feed. Returns the remote-assigned feed id.
    async fn live(&self, sql: &str, vars: &Value) -> EngineResult<String>;

    /// Closes a live feed.
    async fn kill(&self, live_id: &str) -> EngineResult<()>;

    /// Closes the transport.
    async fn close(&self) -> EngineResult<()>;

    /// Subscribes to transport and live feed events.
    fn subscribe_events(&self) -> broadcast::Receiver<RemoteEvent>;

    /// Returns true if the transport believes it is open.
    fn is_connected(&self) -> bool;
}

/// Flattens a select/create/update result into rows.
pub(crate) fn rows_of(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}
