//! Realtime change notifications.
//!
//! The database pushes insert/update/delete notifications per table. The sync
//! layer only needs to know *that* a collection changed (every notification
//! triggers a full re-fetch), so events carry the raw record for logging and
//! diagnostics but nothing depends on it.
//!
//! Two sources are provided:
//! - [`BroadcastRealtime`]: in-process fan-out over tokio broadcast channels
//! - [`PhoenixRealtime`]: Supabase realtime over a websocket

mod broadcast;
pub mod phoenix;

pub use self::broadcast::BroadcastRealtime;
pub use phoenix::{PhoenixConfig, PhoenixRealtime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::{self as channel, error::RecvError};
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;
use uuid::Uuid;

use crate::model::EntityType;

/// Kind of change reported by the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A change notification for one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity_type: EntityType,
    pub kind: ChangeKind,
    /// New row for inserts/updates, when the source provides it
    pub record: Option<Value>,
    pub received_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(entity_type: EntityType, kind: ChangeKind, record: Option<Value>) -> Self {
        Self {
            entity_type,
            kind,
            record,
            received_at: Utc::now(),
        }
    }
}

/// Errors from a realtime source
#[derive(Debug, Clone, thiserror::Error)]
pub enum RealtimeError {
    #[error("Realtime connection failed: {0}")]
    Connection(String),

    #[error("Realtime protocol error: {0}")]
    Protocol(String),

    #[error("Realtime channel closed")]
    Closed,
}

/// Handle on a stream of change events for one collection
pub struct Subscription {
    id: Uuid,
    entity_type: EntityType,
    receiver: channel::Receiver<ChangeEvent>,
}

impl Subscription {
    pub(crate) fn new(entity_type: EntityType, receiver: channel::Receiver<ChangeEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type,
            receiver,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// Next event, or `None` once the source is gone
    ///
    /// Events dropped because this subscriber lagged are skipped; the next
    /// delivered event still triggers a full re-fetch, which covers them.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Realtime subscriber on {} lagged by {} event(s)", self.entity_type, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a stream; lag is surfaced as an error item
    pub fn into_stream(self) -> BroadcastStream<ChangeEvent> {
        BroadcastStream::new(self.receiver)
    }
}

/// A push channel of change notifications
#[async_trait]
pub trait RealtimeSource: Send + Sync {
    async fn subscribe(&self, entity_type: EntityType) -> Result<Subscription, RealtimeError>;

    /// Release a subscription; the source may stop listening on the table
    /// once nobody is subscribed
    async fn unsubscribe(&self, subscription_id: Uuid, entity_type: EntityType);
}
