//! In-memory mirror of the storefront collections read by the UI.
//!
//! Three triggers keep a collection close to the database: optimistic updates
//! from recorded mutations, realtime pushes and the periodic poll. Pushes and
//! polls always re-read the whole collection and replace it, so the last
//! response to land wins and nothing is ever merged. An optimistic change not
//! yet confirmed when a re-read lands is overwritten.
//!
//! Each collection moves through `Stale -> Fetching -> Fresh`; reads never block
//! and return the last known value in every phase.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::gateway::{Applied, GatewayResult, PersistenceGateway};
use crate::model::{Entity, EntityId, EntityType, Mutation, MutationOp};

const EVENT_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionPhase {
    /// Never fetched, last fetch failed, or carrying unconfirmed local changes
    Stale,
    /// At least one re-read in flight
    Fetching,
    /// Matches the last authoritative re-read
    Fresh,
}

/// Change notification for cache readers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheEvent {
    Refreshed { entity_type: EntityType, count: usize },
    Optimistic { entity_type: EntityType },
    RolledBack { entity_type: EntityType },
}

/// Snapshot of one collection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionView {
    pub entity_type: EntityType,
    pub phase: CollectionPhase,
    pub last_fetched: Option<DateTime<Utc>>,
    pub entities: Vec<Entity>,
}

#[derive(Debug)]
struct Collection {
    entities: Vec<Entity>,
    phase: CollectionPhase,
    in_flight: usize,
    last_fetched: Option<DateTime<Utc>>,
}

impl Default for Collection {
    fn default() -> Self {
        Self {
            entities: Vec::new(),
            phase: CollectionPhase::Stale,
            in_flight: 0,
            last_fetched: None,
        }
    }
}

impl Collection {
    fn position(&self, id: &str) -> Option<usize> {
        self.entities.iter().position(|e| e.id == id)
    }

    fn upsert(&mut self, entity: Entity) {
        match self.position(&entity.id) {
            Some(index) => self.entities[index] = entity,
            None => self.entities.push(entity),
        }
    }

    fn remove(&mut self, id: &str) -> Option<(usize, Entity)> {
        let index = self.position(id)?;
        Some((index, self.entities.remove(index)))
    }

    fn mark_local_change(&mut self) {
        if self.in_flight == 0 {
            self.phase = CollectionPhase::Stale;
        }
    }
}

/// How to undo an optimistic change
#[derive(Debug, Clone, PartialEq)]
enum Undo {
    RemovePlaceholder(EntityId),
    /// Put back the previous row at its former position
    Restore { index: usize, entity: Entity },
    Nothing,
}

/// Handle on an optimistic change, resolved by `confirm` or `rollback`
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticTicket {
    pub mutation_id: Uuid,
    pub entity_type: EntityType,
    undo: Undo,
}

impl OptimisticTicket {
    /// Id of the placeholder row created for an optimistic create
    pub fn placeholder_id(&self) -> Option<&str> {
        match &self.undo {
            Undo::RemovePlaceholder(id) => Some(id),
            _ => None,
        }
    }
}

/// Collections shared by the controller and the UI surface
pub struct StateCache {
    collections: DashMap<EntityType, Collection>,
    events: broadcast::Sender<CacheEvent>,
}

impl StateCache {
    pub fn new(watched: &[EntityType]) -> Self {
        let collections = DashMap::new();
        for entity_type in watched {
            collections.insert(*entity_type, Collection::default());
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { collections, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.events.send(event);
    }

    pub fn get(&self, entity_type: EntityType) -> CollectionView {
        match self.collections.get(&entity_type) {
            Some(collection) => CollectionView {
                entity_type,
                phase: collection.phase,
                last_fetched: collection.last_fetched,
                entities: collection.entities.clone(),
            },
            None => CollectionView {
                entity_type,
                phase: CollectionPhase::Stale,
                last_fetched: None,
                entities: Vec::new(),
            },
        }
    }

    pub fn entities(&self, entity_type: EntityType) -> Vec<Entity> {
        self.collections
            .get(&entity_type)
            .map(|c| c.entities.clone())
            .unwrap_or_default()
    }

    pub fn find(&self, entity_type: EntityType, id: &str) -> Option<Entity> {
        let collection = self.collections.get(&entity_type)?;
        collection.entities.iter().find(|e| e.id == id).cloned()
    }

    pub fn phase(&self, entity_type: EntityType) -> CollectionPhase {
        self.collections
            .get(&entity_type)
            .map(|c| c.phase)
            .unwrap_or(CollectionPhase::Stale)
    }

    /// Mark a re-read as started
    pub fn begin_fetch(&self, entity_type: EntityType) {
        let mut collection = self.collections.entry(entity_type).or_default();
        collection.in_flight += 1;
        collection.phase = CollectionPhase::Fetching;
    }

    /// Land a re-read: success replaces the collection wholesale, failure keeps
    /// the last good value
    pub fn complete_fetch(&self, entity_type: EntityType, result: &GatewayResult<Vec<Entity>>) {
        let count = {
            let mut collection = self.collections.entry(entity_type).or_default();
            collection.in_flight = collection.in_flight.saturating_sub(1);
            let settled = collection.in_flight == 0;

            match result {
                Ok(entities) => {
                    collection.entities = entities.clone();
                    collection.last_fetched = Some(Utc::now());
                    if settled {
                        collection.phase = CollectionPhase::Fresh;
                    }
                    Some(entities.len())
                }
                Err(_) => {
                    if settled {
                        collection.phase = CollectionPhase::Stale;
                    }
                    None
                }
            }
        };

        if let Some(count) = count {
            debug!("Replaced {} with {} row(s)", entity_type, count);
            self.emit(CacheEvent::Refreshed { entity_type, count });
        }
    }

    /// Re-read a collection from the gateway and replace it
    pub async fn refresh(
        &self,
        gateway: &dyn PersistenceGateway,
        entity_type: EntityType,
    ) -> GatewayResult<usize> {
        self.begin_fetch(entity_type);
        let result = gateway.list(entity_type, None).await;
        self.complete_fetch(entity_type, &result);

        match result {
            Ok(entities) => Ok(entities.len()),
            Err(e) => {
                warn!("Refresh of {} failed, keeping cached rows: {}", entity_type, e);
                Err(e)
            }
        }
    }

    /// Reflect a mutation before the gateway confirms it
    pub fn apply_optimistic(&self, mutation: &Mutation) -> OptimisticTicket {
        let entity_type = mutation.entity_type;
        let undo = {
            let mut collection = self.collections.entry(entity_type).or_default();
            let undo = match &mutation.op {
                MutationOp::Create { payload } => {
                    let placeholder = Entity::placeholder(mutation.id, payload.clone());
                    let id = placeholder.id.clone();
                    collection.entities.push(placeholder);
                    Undo::RemovePlaceholder(id)
                }
                MutationOp::Update { id, payload } => match collection.position(id) {
                    Some(index) => {
                        let previous = collection.entities[index].clone();
                        collection.entities[index].merge(payload);
                        Undo::Restore {
                            index,
                            entity: previous,
                        }
                    }
                    None => Undo::Nothing,
                },
                MutationOp::Delete { id } => match collection.remove(id) {
                    Some((index, entity)) => Undo::Restore { index, entity },
                    None => Undo::Nothing,
                },
            };
            collection.mark_local_change();
            undo
        };

        self.emit(CacheEvent::Optimistic { entity_type });
        OptimisticTicket {
            mutation_id: mutation.id,
            entity_type,
            undo,
        }
    }

    /// Swap the optimistic reflection for the row the gateway stored
    pub fn confirm(&self, ticket: OptimisticTicket, applied: &Applied) {
        let Some(mut collection) = self.collections.get_mut(&ticket.entity_type) else {
            return;
        };
        if let Undo::RemovePlaceholder(id) = &ticket.undo {
            collection.remove(id);
        }
        if let Applied::Stored(entity) = applied {
            collection.upsert(entity.clone());
        }
    }

    /// Swap a placeholder for the row a replayed create stored
    pub fn resolve_placeholder(&self, entity_type: EntityType, placeholder_id: &str, stored: &Entity) {
        let Some(mut collection) = self.collections.get_mut(&entity_type) else {
            return;
        };
        match collection.position(placeholder_id) {
            Some(index) => collection.entities[index] = stored.clone(),
            None => collection.upsert(stored.clone()),
        }
        debug!("Resolved {} {} to {}", entity_type, placeholder_id, stored.id);
    }

    /// Undo an optimistic change the gateway refused
    pub fn rollback(&self, ticket: OptimisticTicket) {
        {
            let Some(mut collection) = self.collections.get_mut(&ticket.entity_type) else {
                return;
            };
            match ticket.undo {
                Undo::RemovePlaceholder(id) => {
                    collection.remove(&id);
                }
                Undo::Restore { index, entity } => match collection.position(&entity.id) {
                    Some(current) => collection.entities[current] = entity,
                    None => {
                        let index = index.min(collection.entities.len());
                        collection.entities.insert(index, entity);
                    }
                },
                Undo::Nothing => {}
            }
        }
        debug!("Rolled back optimistic change {}", ticket.mutation_id);
        self.emit(CacheEvent::RolledBack {
            entity_type: ticket.entity_type,
        });
    }
}
