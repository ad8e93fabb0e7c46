//! Storefront Sync - offline-aware state synchronization for the storefront
//!
//! Keeps the storefront's client-side collections (products, categories,
//! orders, registrations, blog posts) in step with the remote database:
//! - Writes made offline land in a durable Sled-backed FIFO queue
//! - The queue is replayed in order when connectivity returns
//! - Realtime pushes and a periodic poll re-read whole collections
//! - Every gateway call is bounded by a timeout and cancelled on shutdown

pub mod config;
pub mod gateway;
pub mod model;
pub mod realtime;
pub mod storage;
pub mod sync;

pub use config::{AgentConfig, ConfigError};
pub use gateway::{GatewayError, MemoryGateway, PersistenceGateway, RestGateway};
pub use model::{Entity, EntityType, Mutation, MutationKind, MutationOp};
pub use storage::{QueueStore, StorageConfig, StorageError};
pub use sync::{
    spawn_background_tasks, Connectivity, ConnectivityMonitor, MutationOutcome, SyncConfig,
    SyncController, SyncError, SyncStatus,
};
