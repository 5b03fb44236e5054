//! # casesync store
//!
//! The local embedded store used by the casesync engine for caching and
//! offline state.
//!
//! Records are documents grouped into tables. Every write is appended to a
//! checksummed record log; on open the log is replayed into an in-memory
//! index. The log lives behind the [`LogBackend`] trait so tests can run
//! entirely in memory.
//!
//! ## Layout on disk
//!
//! ```text
//! <data_dir>/
//! ├─ LOCK          # Advisory lock for single-writer
//! └─ store.log     # Record log
//! ```
//!
//! ## Example
//!
//! ```rust
//! use casesync_protocol::Value;
//! use casesync_store::{LocalQuery, LocalStore};
//!
//! let store = LocalStore::open_in_memory().unwrap();
//! store
//!     .create("case", Some("c1"), Value::object([("status", Value::from("open"))]))
//!     .unwrap();
//!
//! let open = store.query(&LocalQuery::new("case").filter("status", "open"));
//! assert_eq!(open.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod backend;
mod config;
mod dir;
mod error;
mod file;
mod frame;
mod memory;
mod query;
mod store;

pub use backend::LogBackend;
pub use config::StoreConfig;
pub use dir::StoreDir;
pub use error::{StoreError, StoreResult};
pub use file::FileLog;
pub use frame::{LogRecord, FRAME_HEADER_SIZE, FRAME_MAGIC};
pub use memory::InMemoryLog;
pub use query::LocalQuery;
pub use store::{CompactionReport, LocalStore, StoreStats};
