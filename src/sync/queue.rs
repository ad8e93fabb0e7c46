//! Durable FIFO queue of mutations awaiting confirmation.
//!
//! The in-memory copy is the source of truth for ordering; every change is
//! written through to the [`QueueStore`] before the call returns. Mutations are
//! never deduplicated or compacted: two updates to the same product both replay.
//!
//! A create queued offline shows up in the cache under a placeholder id, and
//! later writes may name that id. When the create replays, every later queued
//! mutation is rebound to the id the gateway assigned before it is sent.

use parking_lot::Mutex;
use std::future::Future;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::gateway::{Applied, GatewayError};
use crate::model::{Entity, EntityId, EntityType, Mutation};
use crate::storage::{QueueStore, StorageError, StorageResult};

/// Outcome of a drain
#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    /// Mutations confirmed and removed, in replay order
    pub applied: Vec<Mutation>,
    /// Mutations still queued, in original order
    pub remaining: Vec<Mutation>,
    /// Error of the mutation that halted the drain
    pub failure: Option<GatewayError>,
    /// Placeholders whose create was confirmed during this drain
    pub resolved: Vec<ResolvedPlaceholder>,
}

/// A placeholder id and the row the gateway stored for it
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPlaceholder {
    pub entity_type: EntityType,
    pub placeholder_id: EntityId,
    pub entity: Entity,
}

impl DrainReport {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// Pending writes, persisted in insertion order
pub struct MutationQueue {
    store: QueueStore,
    pending: Mutex<Vec<Mutation>>,
    /// Serializes drains so two triggers never replay the same mutation
    drain_lock: tokio::sync::Mutex<()>,
}

impl MutationQueue {
    /// Load the persisted queue
    ///
    /// An unreadable blob is logged and replaced with an empty queue rather
    /// than blocking startup.
    pub fn open(store: QueueStore) -> StorageResult<Self> {
        let pending = match store.load_queue() {
            Ok(pending) => pending,
            Err(StorageError::Corruption(reason)) => {
                error!("Discarding corrupted mutation queue: {}", reason);
                store.save_queue(&[])?;
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        if !pending.is_empty() {
            info!("Restored {} pending mutation(s)", pending.len());
        }

        Ok(Self {
            store,
            pending: Mutex::new(pending),
            drain_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Append a mutation and persist the queue; returns the new length
    pub fn enqueue(&self, mutation: Mutation) -> StorageResult<usize> {
        let mut pending = self.pending.lock();
        pending.push(mutation);
        if let Err(e) = self.store.save_queue(&pending) {
            pending.pop();
            return Err(e);
        }
        debug!("Queued mutation, {} pending", pending.len());
        Ok(pending.len())
    }

    pub fn size(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Copy of the queue in replay order
    pub fn snapshot(&self) -> Vec<Mutation> {
        self.pending.lock().clone()
    }

    /// Drop one mutation (e.g. a write the gateway keeps rejecting)
    pub fn remove(&self, id: Uuid) -> StorageResult<Option<Mutation>> {
        let mut pending = self.pending.lock();
        let Some(index) = pending.iter().position(|m| m.id == id) else {
            return Ok(None);
        };
        let removed = pending.remove(index);
        if let Err(e) = self.store.save_queue(&pending) {
            pending.insert(index, removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    fn front(&self) -> Option<Mutation> {
        self.pending.lock().first().cloned()
    }

    /// Remove a confirmed mutation, rebind writes that named its placeholder,
    /// and persist
    fn confirm(&self, mutation: &Mutation, applied: &Applied) -> Option<ResolvedPlaceholder> {
        let mut pending = self.pending.lock();
        pending.retain(|m| m.id != mutation.id);

        let resolved = match (mutation.placeholder_id(), applied.entity()) {
            (Some(placeholder_id), Some(entity)) => {
                let mut rebound = 0;
                for queued in pending.iter_mut() {
                    if queued.rebind(&placeholder_id, &entity.id) {
                        rebound += 1;
                    }
                }
                if rebound > 0 {
                    info!("Rebound {} queued mutation(s) from {} to {}", rebound, placeholder_id, entity.id);
                }
                Some(ResolvedPlaceholder {
                    entity_type: mutation.entity_type,
                    placeholder_id,
                    entity: entity.clone(),
                })
            }
            _ => None,
        };

        if let Err(e) = self.store.save_queue(&pending) {
            // The mutation is applied remotely; a stale blob only risks a replay after restart
            error!("Failed to persist queue after confirming {}: {}", mutation.id, e);
        }
        resolved
    }

    /// Apply every mutation in insertion order, halting at the first error
    ///
    /// Each mutation is removed as soon as `apply` confirms it, so a halt leaves
    /// exactly the unapplied tail queued. Mutations enqueued while the drain is
    /// running are replayed in the same pass.
    pub async fn drain_all<F, Fut>(&self, mut apply: F) -> DrainReport
    where
        F: FnMut(Mutation) -> Fut + Send,
        Fut: Future<Output = Result<Applied, GatewayError>> + Send,
    {
        let _guard = self.drain_lock.lock().await;
        let mut applied = Vec::new();
        let mut resolved = Vec::new();

        while let Some(mutation) = self.front() {
            match apply(mutation.clone()).await {
                Ok(stored) => {
                    resolved.extend(self.confirm(&mutation, &stored));
                    applied.push(mutation);
                }
                Err(e) => {
                    warn!(
                        "Replay halted at {:?} on {} after {} applied: {}",
                        mutation.kind(),
                        mutation.entity_type,
                        applied.len(),
                        e
                    );
                    return DrainReport {
                        applied,
                        remaining: self.snapshot(),
                        failure: Some(e),
                        resolved,
                    };
                }
            }
        }

        DrainReport {
            applied,
            remaining: Vec::new(),
            failure: None,
            resolved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{fields, MutationKind, MutationOp};
    use crate::storage::StorageConfig;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn temp_queue() -> MutationQueue {
        MutationQueue::open(QueueStore::open_temporary().unwrap()).unwrap()
    }

    fn stock_update(id: &str, stock: i64) -> Mutation {
        Mutation::update(EntityType::Product, id, fields(json!({ "stock": stock })))
    }

    /// Gateway acknowledgement echoing the targeted row
    fn stored(mutation: &Mutation) -> Applied {
        let id = mutation.op.entity_id().unwrap_or("1");
        Applied::Stored(Entity::new(id, crate::model::Fields::new()))
    }

    #[tokio::test]
    async fn test_drain_is_fifo() {
        let queue = temp_queue();
        let mutations: Vec<Mutation> = (1..=5).map(|i| stock_update(&i.to_string(), i)).collect();
        for m in &mutations {
            queue.enqueue(m.clone()).unwrap();
        }

        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let report = queue
            .drain_all(|m| {
                let seen = seen.clone();
                let applied = stored(&m);
                async move {
                    seen.lock().push(m.id);
                    Ok(applied)
                }
            })
            .await;

        assert!(report.is_complete());
        assert_eq!(report.applied, mutations);
        assert_eq!(*seen.lock(), mutations.iter().map(|m| m.id).collect::<Vec<_>>());
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn test_drain_halts_at_failure() {
        let queue = temp_queue();
        let mutations: Vec<Mutation> = (1..=5).map(|i| stock_update("5", i)).collect();
        for m in &mutations {
            queue.enqueue(m.clone()).unwrap();
        }

        // Third mutation fails
        let mut calls = 0;
        let report = queue
            .drain_all(|m| {
                calls += 1;
                let result = if calls == 3 {
                    Err(GatewayError::Transient("connection reset".into()))
                } else {
                    Ok(stored(&m))
                };
                async move { result }
            })
            .await;

        assert_eq!(report.applied, mutations[..2].to_vec());
        assert_eq!(report.remaining, mutations[2..].to_vec());
        assert_eq!(report.failure, Some(GatewayError::Transient("connection reset".into())));
        assert_eq!(queue.snapshot(), mutations[2..].to_vec());
        assert_eq!(queue.size(), 3);
    }

    #[tokio::test]
    async fn test_size_drops_with_each_confirmed_mutation() {
        let queue = temp_queue();
        for i in 1..=5 {
            queue.enqueue(stock_update("5", i)).unwrap();
        }

        // Size seen when each mutation is handed to the gateway; the fourth fails
        let mut sizes = Vec::new();
        let report = queue
            .drain_all(|m| {
                sizes.push(queue.size());
                let result = if sizes.len() == 4 {
                    Err(GatewayError::Transient("connection reset".into()))
                } else {
                    Ok(stored(&m))
                };
                async move { result }
            })
            .await;

        assert_eq!(sizes, vec![5, 4, 3, 2]);
        assert_eq!(report.applied_count(), 3);
        assert_eq!(queue.size(), 2);
        assert_eq!(report.remaining.len(), queue.size());
    }

    #[tokio::test]
    async fn test_replayed_create_rebinds_later_mutations() {
        let queue = temp_queue();
        let create = Mutation::create(EntityType::Category, fields(json!({"name": "Wipes"})));
        let local = create.placeholder_id().unwrap();
        let rename = Mutation::update(EntityType::Category, &local, fields(json!({"name": "Baby Wipes"})));
        let product = Mutation::create(
            EntityType::Product,
            fields(json!({"name": "Wet Wipes", "category_id": local})),
        );
        for m in [&create, &rename, &product] {
            queue.enqueue(m.clone()).unwrap();
        }

        // Create succeeds with id 9, the gateway is then lost
        let sent = Arc::new(SyncMutex::new(Vec::new()));
        let report = queue
            .drain_all(|m| {
                sent.lock().push(m.clone());
                let result = match m.kind() {
                    MutationKind::Create if m.entity_type == EntityType::Category => Ok(
                        Applied::Stored(Entity::new("9", fields(json!({"name": "Wipes"})))),
                    ),
                    _ => Err(GatewayError::Transient("connection reset".into())),
                };
                async move { result }
            })
            .await;

        assert_eq!(report.applied_count(), 1);
        assert_eq!(report.resolved.len(), 1);
        assert_eq!(report.resolved[0].placeholder_id, local);
        assert_eq!(report.resolved[0].entity.id, "9");
        assert_eq!(sent.lock()[1].op.entity_id(), Some("9"));

        // The rebinding is persisted with the queue
        let remaining = queue.store.load_queue().unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].id, rename.id);
        assert_eq!(remaining[0].op.entity_id(), Some("9"));
        assert_eq!(
            remaining[1].op,
            MutationOp::Create {
                payload: fields(json!({"name": "Wet Wipes", "category_id": "9"}))
            }
        );
    }

    #[test]
    fn test_size_tracks_enqueue() {
        let queue = temp_queue();
        for expected in 1..=3 {
            let len = queue.enqueue(stock_update("5", expected as i64)).unwrap();
            assert_eq!(len, expected);
            assert_eq!(queue.size(), expected);
        }
    }

    #[test]
    fn test_no_dedup_for_same_entity() {
        let queue = temp_queue();
        queue.enqueue(stock_update("5", 3)).unwrap();
        queue.enqueue(stock_update("5", 1)).unwrap();

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].op.entity_id(), Some("5"));
        assert_eq!(snapshot[1].op.entity_id(), Some("5"));
    }

    #[test]
    fn test_queue_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.sled").to_string_lossy().to_string();
        let mutations = vec![
            Mutation::create(EntityType::Category, fields(json!({"name": "Wipes"}))),
            stock_update("5", 3),
            Mutation::delete(EntityType::Product, "7"),
        ];

        {
            let queue = MutationQueue::open(QueueStore::open(StorageConfig::new(&path)).unwrap()).unwrap();
            for m in &mutations {
                queue.enqueue(m.clone()).unwrap();
            }
        }

        let queue = MutationQueue::open(QueueStore::open(StorageConfig::new(&path)).unwrap()).unwrap();
        assert_eq!(queue.snapshot(), mutations);
    }

    #[test]
    fn test_corrupted_queue_opens_empty() {
        let store = QueueStore::open_temporary().unwrap();
        store.write_raw(b"[{\"kind\":").unwrap();

        let queue = MutationQueue::open(store.clone()).unwrap();
        assert_eq!(queue.size(), 0);
        assert!(!store.has_queue().unwrap());

        queue.enqueue(stock_update("5", 3)).unwrap();
        assert_eq!(store.load_queue().unwrap().len(), 1);
    }

    #[test]
    fn test_remove() {
        let queue = temp_queue();
        let keep = stock_update("5", 3);
        let drop = stock_update("6", 0);
        queue.enqueue(keep.clone()).unwrap();
        queue.enqueue(drop.clone()).unwrap();

        assert_eq!(queue.remove(drop.id).unwrap(), Some(drop));
        assert_eq!(queue.remove(Uuid::new_v4()).unwrap(), None);
        assert_eq!(queue.snapshot(), vec![keep]);
    }
}
