//! Sled-based storage for the pending mutation queue.
//!
//! The whole queue is stored as a single JSON array under [`QUEUE_KEY`]. Every
//! change reads nothing back and rewrites the full blob, then flushes so the
//! write is on disk before the caller is told the mutation was recorded.

use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::StorageConfig;
use crate::model::Mutation;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corruption detected in persisted queue: {0}")]
    Corruption(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Tree holding sync agent state
const TREE_QUEUE: &str = "mutation_queue";

/// Well-known key of the serialized queue
pub const QUEUE_KEY: &str = "pending_mutations";

/// Durable home of the mutation queue
#[derive(Clone)]
pub struct QueueStore {
    db: Arc<Db>,
    queue: Tree,
}

impl QueueStore {
    /// Open or create a queue store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let mut sled_config = sled::Config::new()
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            });

        if config.temporary {
            sled_config = sled_config.temporary(true);
        } else {
            let path = Path::new(&config.path);

            // Ensure parent directory exists
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::InitFailed(format!("Failed to create directory: {}", e))
                })?;
            }
            sled_config = sled_config.path(&config.path);
        }

        let db = sled_config.open()?;
        let queue = db.open_tree(TREE_QUEUE)?;

        Ok(Self {
            db: Arc::new(db),
            queue,
        })
    }

    /// Open a throwaway in-memory store
    pub fn open_temporary() -> StorageResult<Self> {
        Self::open(StorageConfig::temporary())
    }

    /// Load the persisted queue in insertion order
    ///
    /// A blob that does not parse is reported as [`StorageError::Corruption`];
    /// deciding what to do with it is up to the caller.
    pub fn load_queue(&self) -> StorageResult<Vec<Mutation>> {
        match self.queue.get(QUEUE_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Corruption(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    /// Replace the persisted queue with `mutations`
    pub fn save_queue(&self, mutations: &[Mutation]) -> StorageResult<()> {
        if mutations.is_empty() {
            self.queue.remove(QUEUE_KEY)?;
        } else {
            let bytes = serde_json::to_vec(mutations)?;
            self.queue.insert(QUEUE_KEY, bytes)?;
        }
        self.queue.flush()?;
        Ok(())
    }

    /// Whether a queue blob is currently persisted
    pub fn has_queue(&self) -> StorageResult<bool> {
        Ok(self.queue.contains_key(QUEUE_KEY)?)
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn write_raw(&self, bytes: &[u8]) -> StorageResult<()> {
        self.queue.insert(QUEUE_KEY, bytes)?;
        Ok(())
    }
}

impl Drop for QueueStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}
