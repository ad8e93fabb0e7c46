//! Storage module for the durable mutation queue using Sled.
//!
//! Pending writes survive process restarts by living in an embedded Sled
//! database. The queue is kept as one JSON blob under a well-known key and is
//! rewritten in full whenever it changes.

mod sled_store;

pub use sled_store::{QueueStore, StorageError, StorageResult, QUEUE_KEY};

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 64MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only explicit flushes)
    pub flush_interval_ms: u64,
    /// Use a throwaway database that is removed on drop
    pub temporary: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/storefront-sync.sled".to_string(),
            cache_size: 64 * 1024 * 1024, // 64MB
            flush_interval_ms: 500,
            temporary: false,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// In-memory store for tests and ephemeral agents
    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }
}
