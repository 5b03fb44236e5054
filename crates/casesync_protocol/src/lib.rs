//! # casesync protocol
//!
//! Wire types shared by the casesync engine and its hosts.
//!
//! This crate provides:
//! - [`Value`], the dynamic document value used for rows, payloads and cache entries
//! - [`RecordId`] and [`Resource`] for tagged record references
//! - Request, response and broadcast event envelopes
//! - Typed request payloads
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Tagged references
//!
//! A record reference travels over the wire as an explicit tagged object:
//!
//! ```json
//! {"$rid": {"tb": "case", "id": "c42"}}
//! ```
//!
//! Decoding a payload converts every such object into [`Value::Record`], and
//! encoding converts it back. No other object shape is treated as a reference.
//!
//! ```
//! use casesync_protocol::{RecordId, Value};
//!
//! let value = Value::from_json_str(r#"{"owner": {"$rid": {"tb": "user", "id": "u1"}}}"#).unwrap();
//! assert_eq!(value.get("owner"), Some(&Value::Record(RecordId::new("user", "u1"))));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod error;
mod messages;
mod payloads;
mod record;
mod value;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{Event, OutboundMessage, Request, RequestKind, Response, ResponseStatus};
pub use payloads::{
    AuthenticatePayload, CacheClass, CacheRecordPayload, ChangeAction, CrudPayload,
    IncrementalPayload, KillPayload, LivePayload, MutatePayload, OfflineQueuePayload,
    PageDataPayload, PersonalDataPayload, QueryPayload, RecordKeyPayload, SyncRecordPayload,
    SyncScopePayload, SyncStatusPayload, TableCachePayload, UpdateCachePayload,
};
pub use record::{RecordId, Resource};
pub use value::{from_value, to_value, Value};
