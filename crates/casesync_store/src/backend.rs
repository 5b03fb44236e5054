//! Record log backend trait.

use crate::error::StoreResult;

/// Byte storage for the record log.
///
/// Backends are opaque byte stores: they do not interpret frames. The store
/// owns the log format.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_all` returns every byte appended since the last `replace`
/// - `replace` is atomic: after a crash the log holds either the old or the
///   new content, never a mix
pub trait LogBackend: Send + Sync {
    /// Reads the whole log.
    fn read_all(&self) -> StoreResult<Vec<u8>>;

    /// Appends data to the end of the log, returning its offset.
    fn append(&mut self, data: &[u8]) -> StoreResult<u64>;

    /// Cuts the log back to `len` bytes.
    fn truncate(&mut self, len: u64) -> StoreResult<()>;

    /// Atomically replaces the whole log.
    fn replace(&mut self, data: &[u8]) -> StoreResult<()>;

    /// Makes appended data durable.
    fn sync(&mut self) -> StoreResult<()>;

    /// Returns the current log size in bytes.
    fn size(&self) -> StoreResult<u64>;
}
