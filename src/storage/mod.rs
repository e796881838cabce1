//! Collaborator layer: object store, work queue, keyed store and locks
//!
//! The pipeline depends only on the traits in [`traits`] and [`lock`];
//! [`factory`] turns configuration into concrete backends.

pub mod backends;
pub mod config;
pub mod error;
pub mod factory;
pub mod lock;
pub mod traits;

pub use config::{
    LockScope, ObjectStoreBackend, ObjectStoreConfig, QueueBackend, QueueConfig, RedisConfig,
    S3Config, StoreBackend, StoreConfig,
};
pub use error::{StorageError, StorageResult};
pub use factory::{BackendSettings, Backends, StorageFactory};
pub use lock::{LockBackend, LockManager, StorageLock, StorageLockGuard};
pub use traits::{DeadLetter, DeadLetterReason, Delivery, KeyedStore, ObjectStore, WorkQueue};

/// Name identifying this process as a lock holder and queue consumer
pub fn instance_name() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}
