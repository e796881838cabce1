//! Redis backends: keyed store with `SET NX PX` locks, and a Streams queue
//!
//! The queue uses one consumer group shared by all workers. Deliveries that
//! stay unacknowledged longer than the visibility timeout are claimed by the
//! next consumer that asks for work.

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::model::WorkItem;
use crate::storage::{
    config::{QueueConfig, RedisConfig},
    error::{StorageError, StorageResult},
    lock::{LockBackend, StorageLock, StorageLockGuard},
    traits::*,
};

const PAYLOAD_FIELD: &str = "payload";
const ENTRY_FIELD: &str = "entry";
const STALE_BATCH: usize = 10;

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Create a pool and check that the server answers
pub async fn connect(config: &RedisConfig) -> StorageResult<Pool> {
    info!(url = %config.url, "Connecting to Redis");

    let mut pool_config = Config::from_url(&config.url);
    let mut sizing = PoolConfig::new(config.pool_size);
    sizing.timeouts.wait = Some(Duration::from_secs(10));
    sizing.timeouts.create = Some(Duration::from_secs(10));
    sizing.timeouts.recycle = Some(Duration::from_secs(10));
    pool_config.pool = Some(sizing);

    let pool = pool_config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| StorageError::configuration(format!("Failed to create Redis pool: {}", e)))?;

    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    Ok(pool)
}

/// Keyed store and lock backend on plain Redis keys
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

struct RedisLockGuard {
    lock: StorageLock,
    pool: Pool,
}

#[async_trait]
impl StorageLockGuard for RedisLockGuard {
    fn lock_info(&self) -> &StorageLock {
        &self.lock
    }

    async fn release(self: Box<Self>) -> StorageResult<()> {
        let mut conn = self.pool.get().await?;
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(&self.lock.key)
            .arg(&self.lock.token)
            .invoke_async(&mut conn)
            .await?;
        if deleted == 0 {
            warn!(key = %self.lock.key, "Lock expired before release");
        }
        Ok(())
    }

    async fn is_valid(&self) -> StorageResult<bool> {
        let mut conn = self.pool.get().await?;
        let token: Option<String> = conn.get(&self.lock.key).await?;
        Ok(token.as_deref() == Some(self.lock.token.as_str()))
    }
}

#[async_trait]
impl LockBackend for RedisStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> StorageResult<Box<dyn StorageLockGuard>> {
        let lock = StorageLock::new(key.to_string(), holder.to_string(), ttl);
        let mut conn = self.pool.get().await?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&lock.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;

        match reply {
            Some(_) => Ok(Box::new(RedisLockGuard {
                lock,
                pool: self.pool.clone(),
            })),
            None => Err(StorageError::conflict(format!("Lock already held: {}", key))),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let mut conn = self.pool.get().await?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }
}

#[async_trait]
impl KeyedStore for RedisStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let mut conn = self.pool.get().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StorageResult<()> {
        let mut conn = self.pool.get().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "redis"
    }
}

/// Work queue on a Redis Stream consumed through a consumer group
#[derive(Clone)]
pub struct RedisQueue {
    pool: Pool,
    config: QueueConfig,
    consumer: String,
}

impl RedisQueue {
    /// Create the queue, creating the stream and consumer group when missing
    pub async fn new(pool: Pool, config: QueueConfig, consumer: String) -> StorageResult<Self> {
        let mut conn = pool.get().await?;
        let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&config.stream)
            .arg(&config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => info!(stream = %config.stream, group = %config.group, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(group = %config.group, "Consumer group already exists")
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            pool,
            config,
            consumer,
        })
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Claim one delivery that another consumer left pending too long
    async fn claim_stale(&self) -> StorageResult<Option<Delivery>> {
        let mut conn = self.pool.get().await?;
        let min_idle = self.config.visibility_timeout.as_millis() as usize;
        let pending: StreamPendingCountReply = stale_pending(&self.config, min_idle)
            .query_async(&mut conn)
            .await?;

        // Another consumer may win the claim; try the next stale entry
        for stale in &pending.ids {
            let claimed: StreamClaimReply = conn
                .xclaim(
                    &self.config.stream,
                    &self.config.group,
                    &self.consumer,
                    min_idle,
                    &[&stale.id],
                )
                .await?;

            if let Some(entry) = claimed.ids.into_iter().next() {
                let attempt = stale.times_delivered as u32 + 1;
                debug!(id = %entry.id, attempt, from = %stale.consumer, "Claimed stale delivery");
                return Ok(Some(to_delivery(entry, attempt)));
            }
        }

        Ok(None)
    }
}

/// `XPENDING` filtered server-side to entries idle for at least `min_idle` ms
///
/// Fresh pending entries never hide stale ones behind the page limit.
fn stale_pending(config: &QueueConfig, min_idle: usize) -> redis::Cmd {
    let mut cmd = redis::cmd("XPENDING");
    cmd.arg(&config.stream)
        .arg(&config.group)
        .arg("IDLE")
        .arg(min_idle)
        .arg("-")
        .arg("+")
        .arg(STALE_BATCH);
    cmd
}

fn to_delivery(entry: StreamId, attempt: u32) -> Delivery {
    let payload = entry.get::<Vec<u8>>(PAYLOAD_FIELD).unwrap_or_default();
    Delivery {
        id: entry.id,
        payload,
        attempt,
    }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    async fn publish(&self, item: &WorkItem) -> StorageResult<String> {
        let payload = serde_json::to_vec(item)?;
        let mut conn = self.pool.get().await?;
        let id: String = conn
            .xadd(&self.config.stream, "*", &[(PAYLOAD_FIELD, payload)])
            .await?;
        Ok(id)
    }

    async fn receive(&self) -> StorageResult<Option<Delivery>> {
        if let Some(delivery) = self.claim_stale().await? {
            return Ok(Some(delivery));
        }

        let options = StreamReadOptions::default()
            .group(&self.config.group, &self.consumer)
            .count(1)
            .block(self.config.receive_timeout.as_millis().max(1) as usize);

        let mut conn = self.pool.get().await?;
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.config.stream], &[">"], &options)
            .await?;

        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|key| key.ids.into_iter().next())
            .map(|entry| to_delivery(entry, 1)))
    }

    async fn ack(&self, delivery: &Delivery) -> StorageResult<()> {
        let mut conn = self.pool.get().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg(&delivery.id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.config.stream)
            .arg(&delivery.id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> StorageResult<()> {
        // Streams have no negative acknowledgment; the entry stays pending
        // and is claimed once its idle time passes the visibility timeout.
        debug!(id = %delivery.id, "Leaving delivery pending for redelivery");
        Ok(())
    }

    async fn dead_letter(&self, entry: &DeadLetter) -> StorageResult<()> {
        let encoded = serde_json::to_vec(entry)?;
        let mut conn = self.pool.get().await?;
        let _: String = conn
            .xadd(&self.config.dead_letter_stream, "*", &[(ENTRY_FIELD, encoded)])
            .await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "redis"
    }
}
