//! Persistence gateway abstraction.
//!
//! The storefront database is an external collaborator reached through
//! request/response calls. This module defines:
//! - The [`PersistenceGateway`] trait (create / update / delete / list)
//! - The [`GatewayError`] taxonomy and its transient/rejected classification
//! - [`TimedGateway`], which bounds every call with a timeout and cancels it on shutdown
//! - Two implementations: [`RestGateway`] (PostgREST) and [`MemoryGateway`] (mock catalog)

pub mod memory;
pub mod rest;

pub use memory::{GatewayCall, MemoryGateway};
pub use rest::{RestConfig, RestGateway};

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

use crate::model::{Entity, EntityId, EntityType, Fields, Mutation, MutationOp};

/// Result type for gateway calls
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors reported by a persistence gateway
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// Connectivity failure; the call may succeed if retried
    #[error("Network error: {0}")]
    Transient(String),

    #[error("Gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Gateway call cancelled")]
    Cancelled,

    /// Payload rejected (constraint violation, validation failure)
    #[error("Rejected by gateway ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("{entity_type} {id} not found")]
    NotFound {
        entity_type: EntityType,
        id: EntityId,
    },

    #[error("Unexpected gateway response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Whether replaying the same call later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Transient(_) | GatewayError::Timeout(_) | GatewayError::Cancelled
        )
    }
}

/// Equality filter and ordering for list calls
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListFilter {
    /// `(column, value)` pairs that must all match
    pub equals: Vec<(String, String)>,
    /// Column to order by, ascending unless `descending` is set
    pub order_by: Option<String>,
    pub descending: bool,
    pub limit: Option<usize>,
}

impl ListFilter {
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.equals.push((column.into(), value.into()));
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(column.into());
        self.descending = descending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// CRUD over storefront entities
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn create(&self, entity_type: EntityType, payload: &Fields) -> GatewayResult<Entity>;

    async fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: &Fields,
    ) -> GatewayResult<Entity>;

    async fn delete(&self, entity_type: EntityType, id: &str) -> GatewayResult<()>;

    async fn list(
        &self,
        entity_type: EntityType,
        filter: Option<&ListFilter>,
    ) -> GatewayResult<Vec<Entity>>;
}

/// Result of applying a mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Created or updated row as stored remotely
    Stored(Entity),
    Deleted,
}

impl Applied {
    pub fn entity(&self) -> Option<&Entity> {
        match self {
            Applied::Stored(entity) => Some(entity),
            Applied::Deleted => None,
        }
    }
}

/// Dispatch a mutation to the matching gateway operation
pub async fn apply_mutation(
    gateway: &dyn PersistenceGateway,
    mutation: &Mutation,
) -> GatewayResult<Applied> {
    match &mutation.op {
        MutationOp::Create { payload } => gateway
            .create(mutation.entity_type, payload)
            .await
            .map(Applied::Stored),
        MutationOp::Update { id, payload } => gateway
            .update(mutation.entity_type, id, payload)
            .await
            .map(Applied::Stored),
        MutationOp::Delete { id } => gateway
            .delete(mutation.entity_type, id)
            .await
            .map(|_| Applied::Deleted),
    }
}

/// Apply a queued mutation during replay
///
/// Deleting a row that is already gone counts as applied, so a delete that
/// reached the database before a dropped response does not wedge the queue.
pub async fn replay_mutation(
    gateway: &dyn PersistenceGateway,
    mutation: &Mutation,
) -> GatewayResult<Applied> {
    match apply_mutation(gateway, mutation).await {
        Ok(applied) => Ok(applied),
        Err(GatewayError::NotFound { entity_type, id })
            if matches!(mutation.op, MutationOp::Delete { .. }) =>
        {
            warn!("Replayed delete of {} {} found nothing to delete", entity_type, id);
            Ok(Applied::Deleted)
        }
        Err(e) => Err(e),
    }
}

/// Gateway wrapper enforcing a per-call timeout and shutdown cancellation
pub struct TimedGateway {
    inner: Arc<dyn PersistenceGateway>,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
}

impl TimedGateway {
    /// `cancel` flips to `true` when in-flight calls must be abandoned
    pub fn new(
        inner: Arc<dyn PersistenceGateway>,
        timeout: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner,
            timeout,
            cancel,
        }
    }

    async fn guard<T, F>(&self, call: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>> + Send,
    {
        let mut cancel = self.cancel.clone();
        if *cancel.borrow() {
            return Err(GatewayError::Cancelled);
        }

        tokio::select! {
            result = tokio::time::timeout(self.timeout, call) => {
                result.unwrap_or(Err(GatewayError::Timeout(self.timeout)))
            }
            _ = async {
                // A dropped sender never cancels
                if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
                    std::future::pending::<()>().await;
                }
            } => Err(GatewayError::Cancelled),
        }
    }
}

#[async_trait]
impl PersistenceGateway for TimedGateway {
    async fn create(&self, entity_type: EntityType, payload: &Fields) -> GatewayResult<Entity> {
        self.guard(self.inner.create(entity_type, payload)).await
    }

    async fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: &Fields,
    ) -> GatewayResult<Entity> {
        self.guard(self.inner.update(entity_type, id, payload)).await
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> GatewayResult<()> {
        self.guard(self.inner.delete(entity_type, id)).await
    }

    async fn list(
        &self,
        entity_type: EntityType,
        filter: Option<&ListFilter>,
    ) -> GatewayResult<Vec<Entity>> {
        self.guard(self.inner.list(entity_type, filter)).await
    }
}
