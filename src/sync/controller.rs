//! Sync controller: the single authority over writes.
//!
//! Online, a write goes straight to the gateway; offline, it is appended to the
//! [`MutationQueue`]. Either way the [`StateCache`] reflects it immediately. On
//! reconnect (or a manual or periodic sync) the queue is replayed in order and
//! stops at the first failure. An online write never overtakes a queued one:
//! the queue is replayed first, and if it cannot be emptied the write joins it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cache::StateCache;
use super::notify::{Notification, Notifier};
use super::queue::MutationQueue;
use super::{SyncConfig, SyncError, SyncResult, SyncStatus};
use crate::gateway::{
    apply_mutation, replay_mutation, GatewayError, GatewayResult, PersistenceGateway, TimedGateway,
};
use crate::model::{Entity, EntityId, EntityType, Mutation, MutationOp};
use crate::storage::QueueStore;

/// What happened to a recorded write
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MutationOutcome {
    /// Confirmed by the gateway; `entity` is the stored row (none for deletes)
    Applied { entity: Option<Entity> },
    /// Held in the queue until the next sync
    Queued { pending: usize },
}

/// Result of a complete replay
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrainSummary {
    pub applied: usize,
    /// Collections refreshed because an applied mutation touched them
    pub touched: Vec<EntityType>,
}

#[derive(Debug)]
struct LinkState {
    is_online: bool,
    last_sync: Option<DateTime<Utc>>,
}

pub struct SyncController {
    config: SyncConfig,
    gateway: TimedGateway,
    queue: MutationQueue,
    cache: Arc<StateCache>,
    notifier: Notifier,
    link: RwLock<LinkState>,
    /// Placeholder ids already replaced by a stored id
    resolved_ids: DashMap<EntityId, EntityId>,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncController {
    /// Build a controller over `gateway`, restoring the persisted queue from `store`
    pub fn new(
        config: SyncConfig,
        gateway: Arc<dyn PersistenceGateway>,
        store: QueueStore,
    ) -> SyncResult<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = MutationQueue::open(store)?;
        let cache = Arc::new(StateCache::new(&config.watched));

        info!(
            "Sync controller ready ({} pending, starting {})",
            queue.size(),
            if config.start_online { "online" } else { "offline" }
        );

        Ok(Self {
            gateway: TimedGateway::new(gateway, config.call_timeout, shutdown_rx),
            queue,
            cache,
            notifier: Notifier::new(),
            link: RwLock::new(LinkState {
                is_online: config.start_online,
                last_sync: None,
            }),
            resolved_ids: DashMap::new(),
            shutdown_tx,
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<StateCache> {
        &self.cache
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn is_online(&self) -> bool {
        self.link.read().is_online
    }

    /// Current status; `pending_changes` is read from the queue itself
    pub fn status(&self) -> SyncStatus {
        let link = self.link.read();
        SyncStatus {
            last_sync: link.last_sync,
            is_online: link.is_online,
            pending_changes: self.queue.size(),
        }
    }

    /// Queued mutations in replay order
    pub fn pending(&self) -> Vec<Mutation> {
        self.queue.snapshot()
    }

    fn mark_synced(&self) {
        self.link.write().last_sync = Some(Utc::now());
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Apply a write now when online, otherwise queue it
    ///
    /// While older writes are queued, they are replayed first; the new write
    /// goes to the gateway only once the queue is empty, else it is queued
    /// behind them.
    pub async fn record_mutation(
        &self,
        entity_type: EntityType,
        op: MutationOp,
    ) -> SyncResult<MutationOutcome> {
        let mut mutation = Mutation::new(entity_type, op);
        for resolved in self.resolved_ids.iter() {
            mutation.rebind(resolved.key(), resolved.value());
        }

        if self.is_online() && !self.queue.is_empty() {
            debug!("{} older write(s) pending, replaying before {:?}", self.queue.size(), mutation.kind());
            if let Err(e) = self.drain().await {
                debug!("Replay ahead of new write stopped: {}", e);
            }
        }

        let ticket = self.cache.apply_optimistic(&mutation);

        if !self.is_online() || !self.queue.is_empty() {
            return match self.enqueue(mutation) {
                Ok(outcome) => Ok(outcome),
                Err(e) => {
                    self.cache.rollback(ticket);
                    Err(e)
                }
            };
        }

        match apply_mutation(&self.gateway, &mutation).await {
            Ok(applied) => {
                debug!("Applied {:?} on {}", mutation.kind(), entity_type);
                self.mark_synced();
                let entity = applied.entity().cloned();
                self.cache.confirm(ticket, &applied);
                Ok(MutationOutcome::Applied { entity })
            }
            Err(e) if e.is_transient() && self.config.queue_failed_writes => {
                warn!("Write to {} failed in flight, queueing for replay: {}", entity_type, e);
                match self.enqueue(mutation) {
                    Ok(outcome) => Ok(outcome),
                    Err(storage) => {
                        self.cache.rollback(ticket);
                        Err(storage)
                    }
                }
            }
            Err(e) => {
                self.cache.rollback(ticket);
                if !e.is_transient() {
                    self.notify_rejected(&mutation, &e);
                }
                Err(e.into())
            }
        }
    }

    fn enqueue(&self, mutation: Mutation) -> SyncResult<MutationOutcome> {
        let entity_type = mutation.entity_type;
        let kind = mutation.kind();
        let pending = self.queue.enqueue(mutation)?;
        info!("Queued {:?} on {} ({} pending)", kind, entity_type, pending);
        self.notifier.notify(Notification::MutationQueued {
            entity_type,
            kind,
            pending,
        });
        Ok(MutationOutcome::Queued { pending })
    }

    fn notify_rejected(&self, mutation: &Mutation, error: &GatewayError) {
        warn!("Gateway rejected {:?} on {}: {}", mutation.kind(), mutation.entity_type, error);
        self.notifier.notify(Notification::MutationRejected {
            mutation_id: mutation.id,
            entity_type: mutation.entity_type,
            message: error.to_string(),
        });
    }

    /// Drop a queued mutation, e.g. one the gateway keeps rejecting
    pub fn discard_mutation(&self, id: Uuid) -> SyncResult<Option<Mutation>> {
        let removed = self.queue.remove(id)?;
        if let Some(mutation) = &removed {
            info!("Discarded queued {:?} on {}", mutation.kind(), mutation.entity_type);
        }
        Ok(removed)
    }

    // ========================================================================
    // Replay
    // ========================================================================

    /// Replay the queue in order, then refresh every collection it touched
    ///
    /// Connectivity is checked before each mutation, so going offline halts
    /// the replay at the next step.
    pub async fn drain(&self) -> SyncResult<DrainSummary> {
        let pending = self.queue.size();
        if pending > 0 {
            info!("Replaying {} queued mutation(s)", pending);
        }

        let report = self
            .queue
            .drain_all(move |mutation| async move {
                if !self.is_online() {
                    return Err(GatewayError::Transient("connectivity lost".to_string()));
                }
                replay_mutation(&self.gateway, &mutation).await
            })
            .await;

        for resolved in &report.resolved {
            self.cache
                .resolve_placeholder(resolved.entity_type, &resolved.placeholder_id, &resolved.entity);
            self.resolved_ids
                .insert(resolved.placeholder_id.clone(), resolved.entity.id.clone());
        }

        let touched: Vec<EntityType> = report
            .applied
            .iter()
            .map(|m| m.entity_type)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for entity_type in &touched {
            // Failure keeps the optimistic rows until the next trigger
            let _ = self.refresh(*entity_type).await;
        }

        match report.failure {
            None => {
                self.mark_synced();
                info!("Replay complete, {} applied", report.applied.len());
                Ok(DrainSummary {
                    applied: report.applied.len(),
                    touched,
                })
            }
            Some(source) => {
                if !source.is_transient() {
                    if let Some(blocked) = report.remaining.first() {
                        self.notify_rejected(blocked, &source);
                    }
                }
                Err(SyncError::DrainHalted {
                    applied: report.applied.len(),
                    remaining: report.remaining.len(),
                    source,
                })
            }
        }
    }

    /// Connectivity returned: replay the queue and report the outcome
    pub async fn on_connectivity_restored(&self) -> SyncResult<DrainSummary> {
        self.mark_online();
        self.resync_after_reconnect().await
    }

    pub(super) fn mark_online(&self) {
        self.link.write().is_online = true;
        info!("Back online");
    }

    pub(super) async fn resync_after_reconnect(&self) -> SyncResult<DrainSummary> {
        let result = self.drain().await;
        match &result {
            Ok(summary) => {
                self.notifier.notify(Notification::BackOnline {
                    synced: summary.applied,
                });
                // Realtime pushes were missed while offline
                self.refresh_all().await;
            }
            Err(e) if !self.is_online() => {
                info!("Connectivity lost again during replay: {}", e);
            }
            Err(e) => {
                error!("Sync after reconnect failed: {}", e);
                self.notify_sync_failed(e);
            }
        }
        result
    }

    pub fn on_connectivity_lost(&self) {
        let was_online = std::mem::replace(&mut self.link.write().is_online, false);
        if was_online {
            warn!("Connectivity lost, queueing writes");
            self.notifier.notify(Notification::WentOffline);
        }
    }

    /// User-requested sync; fails immediately while offline
    pub async fn trigger_manual_sync(&self) -> SyncResult<DrainSummary> {
        if !self.is_online() {
            let err = SyncError::Offline;
            self.notify_sync_failed(&err);
            return Err(err);
        }

        let result = self.drain().await;
        match &result {
            Ok(summary) => self.notifier.notify(Notification::SyncCompleted {
                synced: summary.applied,
            }),
            Err(e) => {
                error!("Manual sync failed: {}", e);
                self.notify_sync_failed(e);
            }
        }
        result
    }

    fn notify_sync_failed(&self, error: &SyncError) {
        self.notifier.notify(Notification::SyncFailed {
            message: error.to_string(),
            pending: self.queue.size(),
        });
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Re-read one collection into the cache
    pub async fn refresh(&self, entity_type: EntityType) -> GatewayResult<usize> {
        self.cache.refresh(&self.gateway, entity_type).await
    }

    /// Re-read every watched collection; returns how many succeeded
    pub async fn refresh_all(&self) -> usize {
        let mut refreshed = 0;
        for entity_type in &self.config.watched {
            if self.refresh(*entity_type).await.is_ok() {
                refreshed += 1;
            }
        }
        refreshed
    }

    /// One round of the fallback poll
    ///
    /// Skipped while offline. Replays a non-empty queue first, then re-reads
    /// every watched collection. Failures are logged only.
    pub async fn poll_tick(&self) {
        if !self.is_online() {
            debug!("Offline, skipping poll");
            return;
        }

        if !self.queue.is_empty() {
            if let Err(e) = self.drain().await {
                warn!("Periodic replay failed: {}", e);
            }
        }

        let refreshed = self.refresh_all().await;
        debug!("Poll refreshed {}/{} collection(s)", refreshed, self.config.watched.len());
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Cancel in-flight gateway calls and stop background tasks
    pub fn shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("Sync controller shutting down");
        }
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayCall, MemoryGateway};
    use crate::model::fields;
    use crate::sync::CollectionPhase;
    use serde_json::json;

    fn controller_with(config: SyncConfig) -> (SyncController, Arc<MemoryGateway>) {
        let gateway = Arc::new(MemoryGateway::with_mock_catalog());
        let store = QueueStore::open_temporary().unwrap();
        let controller = SyncController::new(config, gateway.clone(), store).unwrap();
        (controller, gateway)
    }

    fn stock(stock: i64) -> MutationOp {
        MutationOp::Update {
            id: "5".to_string(),
            payload: fields(json!({ "stock": stock })),
        }
    }

    #[tokio::test]
    async fn test_offline_updates_replay_in_order() {
        let (controller, gateway) = controller_with(SyncConfig::default());
        controller.refresh_all().await;
        controller.on_connectivity_lost();

        let first = controller.record_mutation(EntityType::Product, stock(3)).await.unwrap();
        let second = controller.record_mutation(EntityType::Product, stock(1)).await.unwrap();
        assert_eq!(first, MutationOutcome::Queued { pending: 1 });
        assert_eq!(second, MutationOutcome::Queued { pending: 2 });
        assert_eq!(controller.status().pending_changes, 2);
        assert!(gateway.write_calls().is_empty());

        let summary = controller.on_connectivity_restored().await.unwrap();
        assert_eq!(summary.applied, 2);
        assert_eq!(summary.touched, vec![EntityType::Product]);

        assert_eq!(
            gateway.write_calls(),
            vec![
                GatewayCall::Update {
                    entity_type: EntityType::Product,
                    id: "5".into(),
                    payload: fields(json!({"stock": 3})),
                },
                GatewayCall::Update {
                    entity_type: EntityType::Product,
                    id: "5".into(),
                    payload: fields(json!({"stock": 1})),
                },
            ]
        );
        assert_eq!(
            gateway.get(EntityType::Product, "5").unwrap().field("stock"),
            Some(&json!(1))
        );

        let status = controller.status();
        assert_eq!(status.pending_changes, 0);
        assert!(status.is_online);
        assert!(status.last_sync.is_some());
    }

    #[tokio::test]
    async fn test_online_delete_reaches_gateway_and_cache() {
        let (controller, gateway) = controller_with(SyncConfig::default());
        controller.refresh(EntityType::Product).await.unwrap();

        let outcome = controller
            .record_mutation(EntityType::Product, MutationOp::Delete { id: "7".into() })
            .await
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Applied { entity: None });
        assert!(gateway.get(EntityType::Product, "7").is_none());

        controller.refresh(EntityType::Product).await.unwrap();
        assert!(controller.cache().find(EntityType::Product, "7").is_none());
        assert_eq!(controller.cache().entities(EntityType::Product).len(), 7);
        assert_eq!(controller.status().pending_changes, 0);
    }

    #[tokio::test]
    async fn test_failed_replay_keeps_create_queued() {
        let (controller, gateway) = controller_with(SyncConfig::default());
        controller.refresh(EntityType::Category).await.unwrap();
        controller.on_connectivity_lost();

        let outcome = controller
            .record_mutation(
                EntityType::Category,
                MutationOp::Create {
                    payload: fields(json!({"name": "Wipes"})),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Queued { pending: 1 });

        gateway.set_unreachable(true);
        let err = controller.on_connectivity_restored().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::DrainHalted {
                applied: 0,
                remaining: 1,
                ..
            }
        ));

        assert_eq!(controller.pending().len(), 1);
        assert_eq!(controller.status().pending_changes, 1);
        assert_eq!(gateway.rows(EntityType::Category).len(), 4);

        let categories = controller.cache().entities(EntityType::Category);
        assert_eq!(categories.len(), 5);
        assert_eq!(categories.iter().filter(|c| c.is_placeholder()).count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_online_is_queued() {
        let (controller, gateway) = controller_with(SyncConfig::default());
        gateway.set_unreachable(true);

        let outcome = controller.record_mutation(EntityType::Product, stock(9)).await.unwrap();
        assert_eq!(outcome, MutationOutcome::Queued { pending: 1 });
        assert!(controller.is_online());

        gateway.clear_faults();
        let summary = controller.trigger_manual_sync().await.unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(
            gateway.get(EntityType::Product, "5").unwrap().field("stock"),
            Some(&json!(9))
        );
    }

    #[tokio::test]
    async fn test_transient_failure_reported_when_not_queueing() {
        let (controller, gateway) =
            controller_with(SyncConfig::default().with_queue_failed_writes(false));
        controller.refresh(EntityType::Product).await.unwrap();
        gateway.set_unreachable(true);

        let err = controller.record_mutation(EntityType::Product, stock(9)).await.unwrap_err();
        assert!(matches!(err, SyncError::Gateway(GatewayError::Transient(_))));
        assert_eq!(controller.status().pending_changes, 0);
        assert_eq!(
            controller.cache().find(EntityType::Product, "5").unwrap().field("stock"),
            Some(&json!(12))
        );
    }

    #[tokio::test]
    async fn test_rejected_write_rolls_back() {
        let (controller, gateway) = controller_with(SyncConfig::default());
        controller.refresh(EntityType::Product).await.unwrap();
        let mut notifications = controller.notifier().subscribe();
        gateway.fail_writes_after(
            0,
            GatewayError::Rejected {
                status: 400,
                message: "stock must be non-negative".into(),
            },
        );

        let err = controller.record_mutation(EntityType::Product, stock(-1)).await.unwrap_err();
        assert!(matches!(err, SyncError::Gateway(GatewayError::Rejected { status: 400, .. })));
        assert_eq!(controller.status().pending_changes, 0);
        assert_eq!(
            controller.cache().find(EntityType::Product, "5").unwrap().field("stock"),
            Some(&json!(12))
        );
        assert!(matches!(
            notifications.recv().await.unwrap(),
            Notification::MutationRejected {
                entity_type: EntityType::Product,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_manual_sync_offline() {
        let (controller, _gateway) = controller_with(SyncConfig::default().starting_offline());
        let mut notifications = controller.notifier().subscribe();

        let err = controller.trigger_manual_sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Offline));
        assert_eq!(
            notifications.recv().await.unwrap(),
            Notification::SyncFailed {
                message: "Cannot sync while offline".into(),
                pending: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_connectivity_notifications() {
        let (controller, _gateway) = controller_with(SyncConfig::default());
        let mut notifications = controller.notifier().subscribe();

        controller.on_connectivity_lost();
        controller.on_connectivity_lost();
        controller
            .record_mutation(EntityType::Product, stock(4))
            .await
            .unwrap();
        controller.on_connectivity_restored().await.unwrap();

        assert_eq!(notifications.recv().await.unwrap(), Notification::WentOffline);
        assert!(matches!(
            notifications.recv().await.unwrap(),
            Notification::MutationQueued { pending: 1, .. }
        ));
        assert_eq!(
            notifications.recv().await.unwrap(),
            Notification::BackOnline { synced: 1 }
        );
    }

    #[tokio::test]
    async fn test_partial_replay_halts_and_resumes() {
        let (controller, gateway) = controller_with(SyncConfig::default().starting_offline());
        for value in 1..=4 {
            controller
                .record_mutation(EntityType::Product, stock(value))
                .await
                .unwrap();
            assert_eq!(controller.status().pending_changes, value as usize);
        }

        gateway.fail_writes_after(2, GatewayError::Transient("connection reset".into()));
        let err = controller.on_connectivity_restored().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::DrainHalted {
                applied: 2,
                remaining: 2,
                ..
            }
        ));
        assert_eq!(controller.status().pending_changes, 2);
        assert_eq!(
            gateway.get(EntityType::Product, "5").unwrap().field("stock"),
            Some(&json!(2))
        );

        gateway.clear_faults();
        controller.poll_tick().await;
        assert_eq!(controller.status().pending_changes, 0);
        assert_eq!(
            gateway.get(EntityType::Product, "5").unwrap().field("stock"),
            Some(&json!(4))
        );
        assert_eq!(controller.cache().phase(EntityType::Product), CollectionPhase::Fresh);
    }

    #[tokio::test]
    async fn test_online_write_replays_queued_writes_first() {
        let (controller, gateway) = controller_with(SyncConfig::default());
        controller.refresh(EntityType::Product).await.unwrap();

        gateway.set_unreachable(true);
        let first = controller.record_mutation(EntityType::Product, stock(3)).await.unwrap();
        assert_eq!(first, MutationOutcome::Queued { pending: 1 });

        gateway.clear_faults();
        let second = controller.record_mutation(EntityType::Product, stock(1)).await.unwrap();
        assert!(matches!(second, MutationOutcome::Applied { .. }));
        assert_eq!(controller.status().pending_changes, 0);

        controller.poll_tick().await;
        assert_eq!(
            gateway.write_calls(),
            vec![
                GatewayCall::Update {
                    entity_type: EntityType::Product,
                    id: "5".into(),
                    payload: fields(json!({"stock": 3})),
                },
                GatewayCall::Update {
                    entity_type: EntityType::Product,
                    id: "5".into(),
                    payload: fields(json!({"stock": 1})),
                },
            ]
        );
        assert_eq!(
            gateway.get(EntityType::Product, "5").unwrap().field("stock"),
            Some(&json!(1))
        );
        assert_eq!(
            controller.cache().find(EntityType::Product, "5").unwrap().field("stock"),
            Some(&json!(1))
        );
    }

    #[tokio::test]
    async fn test_online_write_queues_behind_blocked_queue() {
        let (controller, gateway) = controller_with(SyncConfig::default());
        controller.refresh(EntityType::Product).await.unwrap();
        gateway.fail_writes_after(0, GatewayError::Transient("connection reset".into()));

        controller.record_mutation(EntityType::Product, stock(3)).await.unwrap();
        let second = controller.record_mutation(EntityType::Product, stock(1)).await.unwrap();
        assert_eq!(second, MutationOutcome::Queued { pending: 2 });
        assert!(gateway.write_calls().is_empty());
        assert_eq!(
            controller.cache().find(EntityType::Product, "5").unwrap().field("stock"),
            Some(&json!(1))
        );

        gateway.clear_faults();
        let summary = controller.trigger_manual_sync().await.unwrap();
        assert_eq!(summary.applied, 2);
        assert_eq!(
            gateway.get(EntityType::Product, "5").unwrap().field("stock"),
            Some(&json!(1))
        );
    }

    #[tokio::test]
    async fn test_offline_create_then_edits_replay_with_stored_id() {
        let (controller, gateway) = controller_with(SyncConfig::default());
        controller.refresh_all().await;
        controller.on_connectivity_lost();

        controller
            .record_mutation(
                EntityType::Category,
                MutationOp::Create {
                    payload: fields(json!({"name": "Wipes"})),
                },
            )
            .await
            .unwrap();
        let local = controller
            .cache()
            .entities(EntityType::Category)
            .into_iter()
            .find(|c| c.is_placeholder())
            .unwrap()
            .id;

        controller
            .record_mutation(
                EntityType::Category,
                MutationOp::Update {
                    id: local.clone(),
                    payload: fields(json!({"name": "Baby Wipes"})),
                },
            )
            .await
            .unwrap();
        controller
            .record_mutation(
                EntityType::Product,
                MutationOp::Create {
                    payload: fields(json!({"name": "Wet Wipes (80 pcs)", "category_id": local})),
                },
            )
            .await
            .unwrap();
        assert_eq!(controller.status().pending_changes, 3);

        let summary = controller.on_connectivity_restored().await.unwrap();
        assert_eq!(summary.applied, 3);
        assert_eq!(controller.status().pending_changes, 0);

        // Seeded categories are 1-4
        let wipes = gateway.get(EntityType::Category, "5").unwrap();
        assert_eq!(wipes.field("name"), Some(&json!("Baby Wipes")));
        let product = gateway.rows(EntityType::Product).pop().unwrap();
        assert_eq!(product.field("category_id"), Some(&json!("5")));
        assert!(controller
            .cache()
            .entities(EntityType::Category)
            .iter()
            .all(|c| !c.is_placeholder()));

        // A stale placeholder id from the UI still reaches the stored row
        let outcome = controller
            .record_mutation(
                EntityType::Category,
                MutationOp::Update {
                    id: local,
                    payload: fields(json!({"name": "Wet Wipes"})),
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, MutationOutcome::Applied { .. }));
        assert_eq!(
            gateway.get(EntityType::Category, "5").unwrap().field("name"),
            Some(&json!("Wet Wipes"))
        );
    }

    #[tokio::test]
    async fn test_offline_create_then_delete() {
        let (controller, gateway) = controller_with(SyncConfig::default().starting_offline());
        controller
            .record_mutation(
                EntityType::Category,
                MutationOp::Create {
                    payload: fields(json!({"name": "Wipes"})),
                },
            )
            .await
            .unwrap();
        let local = controller.pending()[0].placeholder_id().unwrap();
        controller
            .record_mutation(EntityType::Category, MutationOp::Delete { id: local })
            .await
            .unwrap();

        let summary = controller.on_connectivity_restored().await.unwrap();
        assert_eq!(summary.applied, 2);
        assert_eq!(gateway.rows(EntityType::Category).len(), 4);
        assert!(matches!(
            gateway.write_calls()[1],
            GatewayCall::Delete { ref id, .. } if id == "5"
        ));
    }

    #[tokio::test]
    async fn test_halted_replay_leaves_unconfirmed_tail() {
        let (controller, gateway) = controller_with(SyncConfig::default().starting_offline());
        for value in 1..=5 {
            controller
                .record_mutation(EntityType::Product, stock(value))
                .await
                .unwrap();
        }

        gateway.fail_writes_after(3, GatewayError::Transient("connection reset".into()));
        let err = controller.on_connectivity_restored().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::DrainHalted {
                applied: 3,
                remaining: 2,
                ..
            }
        ));
        assert_eq!(controller.status().pending_changes, 2);
        let tail: Vec<MutationOp> = controller.pending().into_iter().map(|m| m.op).collect();
        assert_eq!(tail, vec![stock(4), stock(5)]);
        assert_eq!(
            gateway.get(EntityType::Product, "5").unwrap().field("stock"),
            Some(&json!(3))
        );
    }

    #[tokio::test]
    async fn test_discard_rejected_mutation() {
        let (controller, gateway) = controller_with(SyncConfig::default().starting_offline());
        controller
            .record_mutation(EntityType::Product, MutationOp::Delete { id: "404".into() })
            .await
            .unwrap();
        controller
            .record_mutation(
                EntityType::Order,
                MutationOp::Update {
                    id: "404".into(),
                    payload: fields(json!({"status": "shipped"})),
                },
            )
            .await
            .unwrap();

        // Delete of a missing row replays as applied; the update cannot
        let err = controller.on_connectivity_restored().await.unwrap_err();
        assert!(matches!(err, SyncError::DrainHalted { applied: 1, remaining: 1, .. }));

        let blocked = controller.pending()[0].id;
        assert!(controller.discard_mutation(blocked).unwrap().is_some());
        assert_eq!(controller.status().pending_changes, 0);
        assert!(gateway.write_calls().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_calls() {
        let (controller, gateway) = controller_with(SyncConfig::default());
        controller.shutdown();

        let err = controller.refresh(EntityType::Product).await.unwrap_err();
        assert_eq!(err, GatewayError::Cancelled);
        assert!(gateway.calls().is_empty());
        assert!(*controller.shutdown_receiver().borrow());
    }
}
