//! Distributed locking for the record read-modify-write cycle

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

use super::error::{StorageError, StorageResult};

/// One acquisition of a named lock
///
/// The token distinguishes this acquisition from any later one under the
/// same name, so a holder whose lease ran out cannot release its successor.
#[derive(Debug, Clone)]
pub struct StorageLock {
    pub key: String,
    pub holder: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl StorageLock {
    pub fn new(key: impl Into<String>, holder: impl Into<String>, ttl: Duration) -> Self {
        let lease = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            key: key.into(),
            holder: holder.into(),
            token: Uuid::new_v4().to_string(),
            expires_at: Utc::now().checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Held lock; must be released explicitly
#[async_trait]
pub trait StorageLockGuard: Send + Sync {
    fn lock_info(&self) -> &StorageLock;

    /// Release the lock if this acquisition still owns it
    async fn release(self: Box<Self>) -> StorageResult<()>;

    /// Whether the backend still records this acquisition as the owner
    async fn is_valid(&self) -> StorageResult<bool>;
}

/// Store able to hold named, expiring locks
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Try to acquire a lock once; `StorageError::Conflict` if held elsewhere
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> StorageResult<Box<dyn StorageLockGuard>>;

    /// Whether any unexpired acquisition holds `key`
    async fn exists(&self, key: &str) -> StorageResult<bool>;
}

/// Acquires locks as one named holder, waiting out contention
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    holder: String,
}

impl LockManager {
    const INITIAL_BACKOFF: Duration = Duration::from_millis(2);
    const MAX_BACKOFF: Duration = Duration::from_millis(100);

    pub fn new(backend: Arc<dyn LockBackend>, holder: impl Into<String>) -> Self {
        Self {
            backend,
            holder: holder.into(),
        }
    }

    /// Acquire `key`, polling with capped exponential backoff while it is held
    ///
    /// Returns `StorageError::Timeout` once `timeout` elapses. Backend errors
    /// other than contention end the wait immediately.
    pub async fn wait_for_lock(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> StorageResult<Box<dyn StorageLockGuard>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Self::INITIAL_BACKOFF;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.backend.try_acquire(key, &self.holder, ttl).await {
                Ok(guard) => {
                    trace!(key, attempts, "Acquired lock");
                    return Ok(guard);
                }
                Err(e) if e.is_conflict() => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        debug!(key, attempts, "Timed out waiting for lock");
                        return Err(StorageError::Timeout(timeout));
                    }
                    tokio::time::sleep(delay.min(deadline - now)).await;
                    delay = (delay * 2).min(Self::MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
