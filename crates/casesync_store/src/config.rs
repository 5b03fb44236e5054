//! Store configuration.

/// Configuration for opening a local store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// File name of the record log inside the data directory.
    pub log_file: String,

    /// Log size above which compaction is considered.
    pub compact_threshold_bytes: u64,

    /// Minimum fraction of superseded frames before compacting.
    pub compact_min_garbage_ratio: f64,

    /// Whether to sync the log after every write (safer but slower).
    pub sync_on_write: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            log_file: "store.log".to_string(),
            compact_threshold_bytes: 4 * 1024 * 1024, // 4 MB
            compact_min_garbage_ratio: 0.5,
            sync_on_write: true,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the log file name.
    #[must_use]
    pub fn log_file(mut self, name: impl Into<String>) -> Self {
        self.log_file = name.into();
        self
    }

    /// Sets the compaction size threshold.
    #[must_use]
    pub const fn compact_threshold_bytes(mut self, bytes: u64) -> Self {
        self.compact_threshold_bytes = bytes;
        self
    }

    /// Sets the minimum garbage ratio for compaction.
    #[must_use]
    pub fn compact_min_garbage_ratio(mut self, ratio: f64) -> Self {
        self.compact_min_garbage_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Sets whether to sync after every write.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.log_file, "store.log");
        assert!(config.sync_on_write);
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::new()
            .log_file("cache.log")
            .sync_on_write(false)
            .compact_threshold_bytes(1024)
            .compact_min_garbage_ratio(2.0);
        assert_eq!(config.log_file, "cache.log");
        assert!(!config.sync_on_write);
        assert_eq!(config.compact_threshold_bytes, 1024);
        assert_eq!(config.compact_min_garbage_ratio, 1.0);
    }
}
