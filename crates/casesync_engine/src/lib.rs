//! # CaseSync Engine
//!
//! Background sync engine shared by every client tab.
//!
//! This crate provides:
//! - Connection state machine with exponential-backoff reconnection
//! - Token lifecycle and a short-lived auth state cache
//! - Cache-first query routing with just-in-time table sync
//! - Live subscription fan-out that survives reconnects
//! - Incremental updates with conflict resolution
//! - Durable offline mutation queues
//! - A typed message dispatcher for the client protocol
//!
//! ## Architecture
//!
//! One [`Engine`] owns one remote connection ([`RemoteDatabase`]) and one
//! local store. Clients register with the engine and exchange
//! [`casesync_protocol::Request`]s and [`casesync_protocol::OutboundMessage`]s
//! with it; the engine answers from the local cache where it can and
//! forwards to the remote otherwise.
//!
//! ## Key Invariants
//!
//! - At most one connection attempt is in flight
//! - At most one reconnect loop runs at a time
//! - Every live notification reaches every current subscriber
//! - A cache read after a cache write for the same key sees the write

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(
    not(test),
    warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)
)]

mod auth_cache;
mod cache;
mod config;
mod connection;
mod dispatcher;
mod engine;
mod error;
mod hub;
mod incremental;
mod live;
mod mock;
mod offline;
mod query;
mod remote;
mod router;
mod state;
mod stats;
mod token;
mod ws;

pub use auth_cache::{AuthState, AuthStateCache};
pub use cache::{
    CacheScope, DataCache, PersonalData, RecordCacheDoc, SyncFilter, SyncRecord,
    SyncRecordUpdate, SyncStatus, TableCacheDoc,
};
pub use config::{
    BackoffConfig, ConfigChange, ConnectionConfig, EngineConfig, TableCatalog, TableRule,
};
pub use connection::{ConnectionInfo, ConnectionManager};
pub use dispatcher::Dispatcher;
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult, ErrorClass};
pub use hub::{ClientHub, ClientId, ClientReceiver};
pub use incremental::{
    apply_to_rows, resolve, ConflictStrategy, IncrementalUpdate, RowChange, UpdateOutcome,
};
pub use live::{FeedTarget, LiveRegistry, ResubscribeReport, Subscriber};
pub use mock::MockRemote;
pub use offline::OfflineQueue;
pub use query::{
    CacheTarget, HeuristicExtractor, QueryDescriptor, StatementInfo, StatementKind,
    TableExtractor,
};
pub use remote::{LiveAction, LiveNotification, RemoteDatabase, RemoteEvent};
pub use router::{QueryRouter, ReplayReport};
pub use state::{ConnectionEvent, ConnectionState, Effect, Transition};
pub use stats::{EngineStats, StatsSnapshot};
pub use token::{ClearReason, TokenCheck, TokenGrant, TokenInfo, TokenManager, TokenRefresher};
pub use ws::WsRemote;

/// Internal notifications between components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// A connection was (re-)established.
    Established,
    /// The token was refreshed.
    TokenRefreshed,
    /// Auth state was cleared.
    AuthCleared,
}

pub(crate) type SignalSender = tokio::sync::mpsc::UnboundedSender<Signal>;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
