//! Process record persistence and locked read-modify-write

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{AggregatorError, Result};
use crate::model::ProcessRecord;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::storage::{
    Backends, KeyedStore, LockBackend, LockManager, StorageError, StorageLockGuard, StoreConfig,
};

/// Typed access to process records in the keyed store
#[derive(Clone)]
pub struct RecordStore {
    store: Arc<dyn KeyedStore>,
    locks: LockManager,
    retry: RetryExecutor,
    config: StoreConfig,
}

impl RecordStore {
    pub fn new(
        store: Arc<dyn KeyedStore>,
        locks: Arc<dyn LockBackend>,
        holder: impl Into<String>,
        config: StoreConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            locks: LockManager::new(locks, holder),
            retry: RetryExecutor::new(retry),
            config,
        }
    }

    pub fn from_backends(
        backends: &Backends,
        holder: impl Into<String>,
        config: StoreConfig,
        retry: RetryConfig,
    ) -> Self {
        Self::new(
            backends.store.clone(),
            backends.locks.clone(),
            holder,
            config,
            retry,
        )
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Write a record, replacing whatever is stored under its id
    pub async fn save(&self, record: &ProcessRecord) -> Result<()> {
        let key = self.config.record_key(&record.process_uuid);
        let encoded = serde_json::to_vec(record).map_err(StorageError::from)?;
        let ttl = self.config.record_ttl;

        self.retry
            .execute_with_retry(|| self.store.set(&key, &encoded, ttl), "record write")
            .await?;
        Ok(())
    }

    /// Read a record, retrying transient failures
    pub async fn load(&self, process_uuid: &str) -> Result<Option<ProcessRecord>> {
        let key = self.config.record_key(process_uuid);
        let raw = self
            .retry
            .execute_with_retry(|| self.store.get(&key), "record read")
            .await?;
        raw.map(|bytes| decode(process_uuid, &bytes)).transpose()
    }

    /// Read a record once, without retrying
    pub async fn peek(&self, process_uuid: &str) -> Result<Option<ProcessRecord>> {
        let key = self.config.record_key(process_uuid);
        let raw = self.store.get(&key).await?;
        raw.map(|bytes| decode(process_uuid, &bytes)).transpose()
    }

    /// Apply `change` to the stored record while holding its lock
    ///
    /// The lock is always released, whether or not the change was written.
    pub async fn update<F, T>(&self, process_uuid: &str, change: F) -> Result<T>
    where
        F: FnOnce(&mut ProcessRecord) -> T + Send,
        T: Send,
    {
        let guard = self.acquire(process_uuid).await?;
        let outcome = self.update_locked(process_uuid, guard.as_ref(), change).await;

        if let Err(e) = guard.release().await {
            warn!(process_id = process_uuid, "Failed to release lock: {}", e);
        }
        outcome
    }

    async fn acquire(&self, process_uuid: &str) -> Result<Box<dyn StorageLockGuard>> {
        let name = self.config.lock_scope.lock_name(process_uuid);
        let ttl = self.config.lock_ttl;
        let wait = self.config.lock_wait;

        self.retry
            .execute_with_retry(
                || async {
                    self.locks
                        .wait_for_lock(&name, ttl, wait)
                        .await
                        .map_err(|e| match e {
                            StorageError::Timeout(waited) => AggregatorError::LockTimeout {
                                name: name.clone(),
                                waited,
                            },
                            other => AggregatorError::Storage(other),
                        })
                },
                "lock acquisition",
            )
            .await
    }

    async fn update_locked<F, T>(
        &self,
        process_uuid: &str,
        guard: &dyn StorageLockGuard,
        change: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut ProcessRecord) -> T + Send,
        T: Send,
    {
        let mut record = self
            .load(process_uuid)
            .await?
            .ok_or_else(|| AggregatorError::RecordNotFound(process_uuid.to_string()))?;

        let outcome = change(&mut record);

        if !guard.is_valid().await? {
            return Err(StorageError::lock(format!(
                "Lock {} expired before the record was written",
                guard.lock_info().key
            ))
            .into());
        }
        self.save(&record).await?;

        debug!(
            process_id = process_uuid,
            processed = record.processed_count,
            expected = ?record.expected_count,
            status = %record.status,
            "Updated process record"
        );
        Ok(outcome)
    }
}

fn decode(process_uuid: &str, bytes: &[u8]) -> Result<ProcessRecord> {
    serde_json::from_slice(bytes).map_err(|e| AggregatorError::CorruptRecord {
        process_uuid: process_uuid.to_string(),
        message: e.to_string(),
    })
}
