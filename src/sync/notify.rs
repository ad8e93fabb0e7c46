//! User-facing sync notifications.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::model::{EntityType, MutationKind};

const NOTIFY_CAPACITY: usize = 64;

/// Events surfaced to the UI as toasts or banners
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Connectivity dropped; writes are queued from now on
    WentOffline,
    /// Connectivity returned and the queue was replayed
    BackOnline { synced: usize },
    /// A manual or periodic sync finished
    SyncCompleted { synced: usize },
    SyncFailed { message: String, pending: usize },
    MutationQueued {
        entity_type: EntityType,
        kind: MutationKind,
        pending: usize,
    },
    /// The gateway refused a write; the optimistic change was rolled back
    MutationRejected {
        mutation_id: Uuid,
        entity_type: EntityType,
        message: String,
    },
}

/// Broadcasts notifications to every listener
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self { tx }
    }

    pub fn notify(&self, notification: Notification) {
        debug!("Notification: {:?}", notification);
        // No listeners is fine
        let _ = self.tx.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}
