//! In-process realtime hub built on tokio broadcast channels.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use super::{ChangeEvent, RealtimeError, RealtimeSource, Subscription};
use crate::model::EntityType;

/// Buffered events per table before slow subscribers start lagging
const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of change events to per-table subscribers
pub struct BroadcastRealtime {
    channels: DashMap<EntityType, broadcast::Sender<ChangeEvent>>,
    subscribers: DashMap<Uuid, EntityType>,
    closed: AtomicBool,
}

impl Default for BroadcastRealtime {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastRealtime {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            subscribers: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn sender(&self, entity_type: EntityType) -> broadcast::Sender<ChangeEvent> {
        self.channels
            .entry(entity_type)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Deliver an event to every subscriber of its table; returns the number reached
    pub fn publish(&self, event: ChangeEvent) -> usize {
        match self.channels.get(&event.entity_type) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Subscribe without going through the async trait
    ///
    /// On a closed hub the subscription ends immediately.
    pub fn subscribe_to(&self, entity_type: EntityType) -> Subscription {
        if self.is_closed() {
            let (_, receiver) = broadcast::channel(1);
            return Subscription::new(entity_type, receiver);
        }
        let subscription = Subscription::new(entity_type, self.sender(entity_type).subscribe());
        self.subscribers.insert(subscription.id(), entity_type);
        subscription
    }

    /// Forget a subscription id
    pub fn release(&self, subscription_id: Uuid) -> Option<EntityType> {
        self.subscribers.remove(&subscription_id).map(|(_, t)| t)
    }

    /// Registered subscriptions on a table
    pub fn subscriber_count(&self, entity_type: EntityType) -> usize {
        self.subscribers.iter().filter(|s| *s.value() == entity_type).count()
    }

    /// Stop delivering events; every open subscription then ends
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.channels.clear();
            info!("Realtime hub closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeSource for BroadcastRealtime {
    async fn subscribe(&self, entity_type: EntityType) -> Result<Subscription, RealtimeError> {
        if self.is_closed() {
            return Err(RealtimeError::Closed);
        }
        Ok(self.subscribe_to(entity_type))
    }

    async fn unsubscribe(&self, subscription_id: Uuid, _entity_type: EntityType) {
        self.release(subscription_id);
    }
}
