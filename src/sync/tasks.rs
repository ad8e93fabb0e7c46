//! Long-lived tasks driving reconciliation and replay.
//!
//! - Poll task: every `poll_interval`, replay pending writes and re-read all
//!   watched collections (first round runs immediately as the initial load)
//! - Realtime tasks: one per watched collection, re-reading it on every push
//! - Connectivity task: reacts to online/offline edges; the replay after a
//!   reconnect runs on its own task so a later offline edge applies at once
//!
//! All tasks stop when the controller shuts down.

use futures_util::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::connectivity::Connectivity;
use super::controller::SyncController;
use crate::model::EntityType;
use crate::realtime::RealtimeSource;

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub poll_task: JoinHandle<()>,
    pub connectivity_task: JoinHandle<()>,
    pub realtime_tasks: Vec<JoinHandle<()>>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = tokio::join!(
            self.poll_task,
            self.connectivity_task,
            join_all(self.realtime_tasks)
        );
    }
}

/// Resolves once shutdown is signalled (or the controller is gone)
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Start every background task for `controller`
pub fn spawn_background_tasks(
    controller: Arc<SyncController>,
    realtime: Option<Arc<dyn RealtimeSource>>,
    connectivity: watch::Receiver<Connectivity>,
) -> BackgroundTaskHandles {
    let poll_task = spawn_poll_task(controller.clone());
    let connectivity_task = spawn_connectivity_task(controller.clone(), connectivity);

    let realtime_tasks = match realtime {
        Some(source) => controller
            .config()
            .watched
            .iter()
            .map(|entity_type| spawn_realtime_task(controller.clone(), source.clone(), *entity_type))
            .collect(),
        None => {
            info!("No realtime source, relying on polling");
            Vec::new()
        }
    };

    BackgroundTaskHandles {
        poll_task,
        connectivity_task,
        realtime_tasks,
    }
}

fn spawn_poll_task(controller: Arc<SyncController>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(controller.config().poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = controller.shutdown_receiver();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    controller.poll_tick().await;
                }
                _ = stopped(&mut shutdown) => {
                    info!("Poll task shutting down");
                    break;
                }
            }
        }
    })
}

fn spawn_realtime_task(
    controller: Arc<SyncController>,
    source: Arc<dyn RealtimeSource>,
    entity_type: EntityType,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscription = match source.subscribe(entity_type).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!("Realtime subscribe to {} failed: {}", entity_type, e);
                return;
            }
        };
        debug!("Listening for realtime changes on {}", entity_type);
        let mut shutdown = controller.shutdown_receiver();

        loop {
            tokio::select! {
                event = subscription.recv() => {
                    let Some(event) = event else {
                        warn!("Realtime source for {} closed, relying on polling", entity_type);
                        break;
                    };
                    debug!("Realtime {:?} on {}, re-reading", event.kind, entity_type);
                    // Failures keep the last good rows
                    let _ = controller.refresh(entity_type).await;
                }
                _ = stopped(&mut shutdown) => {
                    source.unsubscribe(subscription.id(), entity_type).await;
                    debug!("Realtime listener on {} shutting down", entity_type);
                    break;
                }
            }
        }
    })
}

fn spawn_connectivity_task(
    controller: Arc<SyncController>,
    mut connectivity: watch::Receiver<Connectivity>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = controller.shutdown_receiver();
        let mut resync: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        info!("Connectivity source dropped");
                        break;
                    }
                    let state = *connectivity.borrow_and_update();
                    match state {
                        Connectivity::Online => {
                            controller.mark_online();
                            let controller = controller.clone();
                            // Outcome is logged and notified by the controller
                            resync = Some(tokio::spawn(async move {
                                let _ = controller.resync_after_reconnect().await;
                            }));
                        }
                        Connectivity::Offline => controller.on_connectivity_lost(),
                    }
                }
                _ = stopped(&mut shutdown) => {
                    info!("Connectivity task shutting down");
                    break;
                }
            }
        }

        if let Some(resync) = resync {
            let _ = resync.await;
        }
    })
}
