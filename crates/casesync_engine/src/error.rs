//! Error types for the engine.

use casesync_protocol::ProtocolError;
use casesync_store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Broad class of an error, deciding how the engine reacts to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Transport unreachable or timed out. Triggers reconnection.
    Connection,
    /// Refresh failed or tenant missing. Clears auth state.
    Auth,
    /// Malformed query or remote rejection. Returned verbatim.
    Query,
    /// Local store failure. Treated as a cache miss.
    Cache,
    /// Malformed request.
    Protocol,
}

impl ErrorClass {
    /// Returns the wire name of the class.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Connection => "connection",
            ErrorClass::Auth => "auth",
            ErrorClass::Query => "query",
            ErrorClass::Cache => "cache",
            ErrorClass::Protocol => "protocol",
        }
    }
}

/// Errors that can occur in the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The remote service is unreachable or the connection dropped.
    #[error("connection error: {message}")]
    Connection {
        /// Error message.
        message: String,
    },

    /// A connect or probe did not finish in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// No connection configuration was supplied or persisted.
    #[error("no connection configuration available")]
    NotConfigured,

    /// Authentication failed or the token could not be refreshed.
    #[error("authentication error: {0}")]
    Auth(String),

    /// The stored token has no tenant code.
    #[error("tenant code missing")]
    TenantMissing,

    /// The remote service rejected a query.
    #[error("query error: {0}")]
    Query(String),

    /// Local store failure.
    #[error("cache error: {0}")]
    Cache(#[from] StoreError),

    /// Malformed request or payload.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The engine is shutting down.
    #[error("engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query(message.into())
    }

    /// Creates an auth error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// Creates an invalid payload error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Protocol(ProtocolError::InvalidPayload(message.into()))
    }

    /// Returns the error class.
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Connection { .. }
            | EngineError::Timeout(_)
            | EngineError::NotConfigured
            | EngineError::ShuttingDown => ErrorClass::Connection,
            EngineError::Auth(_) | EngineError::TenantMissing => ErrorClass::Auth,
            EngineError::Query(_) => ErrorClass::Query,
            EngineError::Cache(_) => ErrorClass::Cache,
            EngineError::Protocol(_) => ErrorClass::Protocol,
        }
    }

    /// Returns true if this error should start the reconnection loop.
    pub fn triggers_reconnect(&self) -> bool {
        self.class() == ErrorClass::Connection
    }
}
