//! Backend factory

use std::sync::Arc;
use tracing::info;

use super::backends::{FileObjectStore, MemoryObjectStore, MemoryQueue, MemoryStore};
#[cfg(feature = "redis")]
use super::backends::{RedisQueue, RedisStore};
#[cfg(feature = "s3")]
use super::backends::S3ObjectStore;
use super::config::{
    ObjectStoreBackend, ObjectStoreConfig, QueueBackend, QueueConfig, RedisConfig, StoreBackend,
    StoreConfig,
};
use super::error::{StorageError, StorageResult};
use super::lock::LockBackend;
use super::traits::{KeyedStore, ObjectStore, WorkQueue};

/// The full set of collaborators one process works with
#[derive(Clone)]
pub struct Backends {
    pub objects: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub store: Arc<dyn KeyedStore>,
    pub locks: Arc<dyn LockBackend>,
}

impl Backends {
    /// Bundle backends; the lock backend is the keyed store itself
    pub fn new<S>(objects: Arc<dyn ObjectStore>, queue: Arc<dyn WorkQueue>, store: Arc<S>) -> Self
    where
        S: KeyedStore + 'static,
    {
        Self {
            objects,
            queue,
            locks: store.clone(),
            store,
        }
    }
}

/// Selection of backends, one per collaborator
pub struct BackendSettings<'a> {
    pub object_store: &'a ObjectStoreConfig,
    pub queue: &'a QueueConfig,
    pub store: &'a StoreConfig,
    pub redis: &'a RedisConfig,
    /// Consumer name for queue backends that track consumers
    pub instance: &'a str,
}

/// Factory for creating backend instances
pub struct StorageFactory;

impl StorageFactory {
    /// Create backends from explicit configuration
    pub async fn from_config(settings: &BackendSettings<'_>) -> StorageResult<Backends> {
        let objects = Self::object_store(settings.object_store).await?;

        #[cfg(feature = "redis")]
        let pool = if settings.queue.backend == QueueBackend::Redis
            || settings.store.backend == StoreBackend::Redis
        {
            Some(super::backends::redis::connect(settings.redis).await?)
        } else {
            None
        };

        let queue: Arc<dyn WorkQueue> = match settings.queue.backend {
            QueueBackend::Memory => Arc::new(MemoryQueue::from_config(settings.queue)),
            #[cfg(feature = "redis")]
            QueueBackend::Redis => {
                let pool = pool.clone().ok_or_else(|| missing_pool("queue"))?;
                let consumer = settings
                    .queue
                    .consumer
                    .clone()
                    .unwrap_or_else(|| settings.instance.to_string());
                Arc::new(RedisQueue::new(pool, settings.queue.clone(), consumer).await?)
            }
            #[cfg(not(feature = "redis"))]
            QueueBackend::Redis => return Err(feature_disabled("Redis queue", "redis")),
        };

        let backends = match settings.store.backend {
            StoreBackend::Memory => Backends::new(objects, queue, Arc::new(MemoryStore::new())),
            #[cfg(feature = "redis")]
            StoreBackend::Redis => {
                let pool = pool.ok_or_else(|| missing_pool("store"))?;
                Backends::new(objects, queue, Arc::new(RedisStore::new(pool)))
            }
            #[cfg(not(feature = "redis"))]
            StoreBackend::Redis => return Err(feature_disabled("Redis store", "redis")),
        };

        info!(
            objects = backends.objects.backend_type(),
            queue = backends.queue.backend_type(),
            store = backends.store.backend_type(),
            "Initialized backends"
        );
        Ok(backends)
    }

    /// Create the object store alone
    pub async fn object_store(config: &ObjectStoreConfig) -> StorageResult<Arc<dyn ObjectStore>> {
        match config.backend {
            ObjectStoreBackend::File => Ok(Arc::new(FileObjectStore::new(&config.root))),
            ObjectStoreBackend::Memory => Ok(Arc::new(MemoryObjectStore::new())),
            #[cfg(feature = "s3")]
            ObjectStoreBackend::S3 => Ok(Arc::new(S3ObjectStore::new(&config.s3).await?)),
            #[cfg(not(feature = "s3"))]
            ObjectStoreBackend::S3 => Err(feature_disabled("S3 object store", "s3")),
        }
    }
}

#[cfg(not(all(feature = "redis", feature = "s3")))]
fn feature_disabled(what: &str, feature: &str) -> StorageError {
    StorageError::configuration(format!(
        "{} not enabled. Enable with --features {}",
        what, feature
    ))
}

#[cfg(feature = "redis")]
fn missing_pool(what: &str) -> StorageError {
    StorageError::configuration(format!("No Redis connection for the {}", what))
}
