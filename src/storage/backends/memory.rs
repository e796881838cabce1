//! In-memory backends for standalone mode and testing

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;

use crate::model::WorkItem;
use crate::storage::{
    config::QueueConfig,
    error::{StorageError, StorageResult},
    lock::{LockBackend, StorageLock, StorageLockGuard},
    traits::*,
};

/// Fails the next `n` calls with `StorageError::Unavailable`
#[derive(Debug, Clone, Default)]
pub struct FailureInjector {
    remaining: Arc<AtomicU32>,
}

impl FailureInjector {
    pub fn inject(&self, n: u32) {
        self.remaining.store(n, Ordering::SeqCst);
    }

    fn check(&self, operation: &str) -> StorageResult<()> {
        let taken = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(StorageError::unavailable(format!(
                "injected failure in {}",
                operation
            ))),
            Err(_) => Ok(()),
        }
    }
}

/// Object store over an in-process map of containers
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    containers: Arc<RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>>,
    failures: FailureInjector,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, container: &str, name: &str, contents: impl Into<Vec<u8>>) {
        self.containers
            .write()
            .await
            .entry(container.to_string())
            .or_default()
            .insert(name.to_string(), contents.into());
    }

    /// Fail the next `n` list or read calls
    pub fn inject_failures(&self, n: u32) {
        self.failures.inject(n);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, container: &str) -> StorageResult<Vec<String>> {
        self.failures.check("list")?;
        Ok(self
            .containers
            .read()
            .await
            .get(container)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn read(&self, container: &str, name: &str) -> StorageResult<Vec<u8>> {
        self.failures.check("read")?;
        self.containers
            .read()
            .await
            .get(container)
            .and_then(|objects| objects.get(name))
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("{}/{}", container, name)))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[derive(Debug, Clone)]
struct Message {
    id: String,
    payload: Vec<u8>,
    deliveries: u32,
}

#[derive(Debug)]
struct InFlight {
    message: Message,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    ready: VecDeque<Message>,
    in_flight: HashMap<String, InFlight>,
    dead_letters: Vec<DeadLetter>,
}

impl QueueState {
    /// Move deliveries whose visibility expired back to the ready queue
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(flight) = self.in_flight.remove(&id) {
                self.ready.push_back(flight.message);
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.deadline).min()
    }
}

/// At-least-once queue with visibility timeouts and redelivery
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    receive_timeout: Duration,
    visibility_timeout: Duration,
    failures: FailureInjector,
}

impl MemoryQueue {
    pub fn new(receive_timeout: Duration, visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            receive_timeout,
            visibility_timeout,
            failures: FailureInjector::default(),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.receive_timeout, config.visibility_timeout)
    }

    /// Enqueue an arbitrary payload, bypassing work item encoding
    pub async fn publish_raw(&self, payload: impl Into<Vec<u8>>) -> String {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = format!("{}-0", state.next_id);
        state.ready.push_back(Message {
            id: id.clone(),
            payload: payload.into(),
            deliveries: 0,
        });
        drop(state);
        self.notify.notify_one();
        id
    }

    /// Entries routed to the dead-letter path so far
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Messages not yet acknowledged, ready or in flight
    pub async fn pending(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.in_flight.len()
    }

    /// Fail the next `n` publish calls
    pub fn inject_failures(&self, n: u32) {
        self.failures.inject(n);
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn publish(&self, item: &WorkItem) -> StorageResult<String> {
        self.failures.check("publish")?;
        let payload = serde_json::to_vec(item)?;
        Ok(self.publish_raw(payload).await)
    }

    async fn receive(&self) -> StorageResult<Option<Delivery>> {
        let deadline = Instant::now() + self.receive_timeout;

        loop {
            let wake_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.requeue_expired(now);

                if let Some(mut message) = state.ready.pop_front() {
                    message.deliveries += 1;
                    let delivery = Delivery {
                        id: message.id.clone(),
                        payload: message.payload.clone(),
                        attempt: message.deliveries,
                    };
                    state.in_flight.insert(
                        message.id.clone(),
                        InFlight {
                            message,
                            deadline: now + self.visibility_timeout,
                        },
                    );
                    return Ok(Some(delivery));
                }

                if now >= deadline {
                    return Ok(None);
                }
                state
                    .next_expiry()
                    .map_or(deadline, |expiry| expiry.min(deadline))
            };

            let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(&delivery.id).is_none() {
            // Visibility expired before the ack; drop the redelivery instead
            state.ready.retain(|m| m.id != delivery.id);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        if let Some(flight) = state.in_flight.remove(&delivery.id) {
            state.ready.push_back(flight.message);
            drop(state);
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn dead_letter(&self, entry: &DeadLetter) -> StorageResult<()> {
        self.state.lock().await.dead_letters.push(entry.clone());
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

/// Keyed store with expiring entries and in-process locks
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, (Vec<u8>, Instant)>>>,
    locks: Arc<RwLock<HashMap<String, StorageLock>>>,
    failures: FailureInjector,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` get or set calls
    pub fn inject_failures(&self, n: u32) {
        self.failures.inject(n);
    }
}

/// Lock guard for the memory store
struct MemoryLockGuard {
    lock: StorageLock,
    locks: Arc<RwLock<HashMap<String, StorageLock>>>,
}

#[async_trait]
impl StorageLockGuard for MemoryLockGuard {
    fn lock_info(&self) -> &StorageLock {
        &self.lock
    }

    async fn release(self: Box<Self>) -> StorageResult<()> {
        let mut locks = self.locks.write().await;
        // A lock that expired and was taken over belongs to someone else now
        if locks
            .get(&self.lock.key)
            .is_some_and(|held| held.token == self.lock.token)
        {
            locks.remove(&self.lock.key);
        }
        Ok(())
    }

    async fn is_valid(&self) -> StorageResult<bool> {
        let locks = self.locks.read().await;
        Ok(locks
            .get(&self.lock.key)
            .is_some_and(|held| held.token == self.lock.token && !held.is_expired()))
    }
}

#[async_trait]
impl LockBackend for MemoryStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> StorageResult<Box<dyn StorageLockGuard>> {
        let mut locks = self.locks.write().await;

        if let Some(existing) = locks.get(key) {
            if !existing.is_expired() {
                return Err(StorageError::conflict(format!(
                    "Lock already held: {} by {}",
                    key, existing.holder
                )));
            }
        }

        let lock = StorageLock::new(key.to_string(), holder.to_string(), ttl);
        locks.insert(key.to_string(), lock.clone());

        Ok(Box::new(MemoryLockGuard {
            lock,
            locks: Arc::clone(&self.locks),
        }))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let locks = self.locks.read().await;
        Ok(locks.get(key).is_some_and(|lock| !lock.is_expired()))
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.failures.check("get")?;
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StorageResult<()> {
        self.failures.check("set")?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
