//! In-memory log backend for tests and ephemeral stores.

use crate::backend::LogBackend;
use crate::error::StoreResult;
use parking_lot::RwLock;
use std::sync::Arc;

/// A log held entirely in memory.
///
/// Clones share the same buffer, which lets tests "reopen" a store over the
/// bytes a previous instance wrote.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLog {
    data: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log pre-filled with bytes.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a copy of the current bytes.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl LogBackend for InMemoryLog {
    fn read_all(&self) -> StoreResult<Vec<u8>> {
        Ok(self.data.read().clone())
    }

    fn append(&mut self, data: &[u8]) -> StoreResult<u64> {
        let mut buf = self.data.write();
        let offset = buf.len() as u64;
        buf.extend_from_slice(data);
        Ok(offset)
    }

    fn truncate(&mut self, len: u64) -> StoreResult<()> {
        let mut buf = self.data.write();
        let len = usize::try_from(len).unwrap_or(usize::MAX).min(buf.len());
        buf.truncate(len);
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> StoreResult<()> {
        *self.data.write() = data.to_vec();
        Ok(())
    }

    fn sync(&mut self) -> StoreResult<()> {
        Ok(())
    }

    fn size(&self) -> StoreResult<u64> {
        Ok(self.data.read().len() as u64)
    }
}
