//! Offline-aware synchronization of the storefront state store.
//!
//! This module implements the client-side sync layer:
//! - Durable FIFO queue of writes made while offline
//! - Collection cache with optimistic updates and full-refresh reconciliation
//! - Controller deciding between applying a write now and queueing it
//! - Background tasks for polling, realtime listeners and connectivity edges

pub mod cache;
pub mod connectivity;
pub mod controller;
pub mod notify;
pub mod queue;
pub mod tasks;

pub use cache::{CacheEvent, CollectionPhase, CollectionView, OptimisticTicket, StateCache};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use controller::{DrainSummary, MutationOutcome, SyncController};
pub use notify::{Notification, Notifier};
pub use queue::{DrainReport, MutationQueue, ResolvedPlaceholder};
pub use tasks::{spawn_background_tasks, BackgroundTaskHandles};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::gateway::GatewayError;
use crate::model::EntityType;
use crate::storage::StorageError;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the sync controller
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Cannot sync while offline")]
    Offline,

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Replay stopped at the first failing mutation
    #[error("Replay halted after {applied} mutation(s), {remaining} still pending: {source}")]
    DrainHalted {
        applied: usize,
        remaining: usize,
        #[source]
        source: GatewayError,
    },
}

/// Process-wide sync state shown to the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub last_sync: Option<DateTime<Utc>>,
    pub is_online: bool,
    pub pending_changes: usize,
}

/// Configuration for sync behavior
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval of the fallback poll re-fetching every watched collection
    pub poll_interval: Duration,
    /// Upper bound on every gateway call
    pub call_timeout: Duration,
    /// Collections kept in the cache
    pub watched: Vec<EntityType>,
    /// Queue writes that fail with a transient error while online
    pub queue_failed_writes: bool,
    /// Connectivity assumed before the first signal arrives
    pub start_online: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
            watched: EntityType::ALL.to_vec(),
            queue_failed_writes: true,
            start_online: true,
        }
    }
}

impl SyncConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_watched(mut self, watched: impl Into<Vec<EntityType>>) -> Self {
        self.watched = watched.into();
        self
    }

    pub fn with_queue_failed_writes(mut self, enabled: bool) -> Self {
        self.queue_failed_writes = enabled;
        self
    }

    pub fn starting_offline(mut self) -> Self {
        self.start_online = false;
        self
    }
}
