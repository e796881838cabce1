//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use trc_aggregator::app::{AppConfig, Services};
use trc_aggregator::model::{Aggregates, GroupKey, Measurement};
use trc_aggregator::pipeline::run_pool;
use trc_aggregator::retry::RetryConfig;
use trc_aggregator::storage::backends::{MemoryObjectStore, MemoryQueue, MemoryStore};
use trc_aggregator::storage::{Backends, DeadLetter};

pub const CONTAINER: &str = "bucket";

/// Configuration tuned for fast tests
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.object_store.container = CONTAINER.to_string();
    config.orchestrator.poll_interval = Duration::from_millis(5);
    config.orchestrator.timeout = Duration::from_secs(10);
    config.queue.receive_timeout = Duration::from_millis(20);
    config.queue.visibility_timeout = Duration::from_millis(500);
    config.store.lock_wait = Duration::from_secs(2);
    config.worker.parallelism = Some(2);
    config.worker.idle_backoff = Duration::from_millis(5);
    config.retry = RetryConfig {
        attempts: 5,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(20),
        jitter: false,
        ..Default::default()
    };
    config
}

/// In-memory backends plus the services built over them
pub struct Harness {
    pub objects: Arc<MemoryObjectStore>,
    pub queue: Arc<MemoryQueue>,
    pub store: Arc<MemoryStore>,
    pub config: AppConfig,
    pub services: Services,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        Self::with_objects(config, Arc::new(MemoryObjectStore::new()))
    }

    fn with_objects(config: AppConfig, objects: Arc<MemoryObjectStore>) -> Self {
        let queue = Arc::new(MemoryQueue::from_config(&config.queue));
        let store = Arc::new(MemoryStore::new());
        let backends = Backends::new(objects.clone(), queue.clone(), store.clone());
        let services = Services::new(&config, &backends, "test-instance");
        Self {
            objects,
            queue,
            store,
            config,
            services,
        }
    }

    pub async fn add_file(&self, name: &str, contents: &str) {
        self.objects.insert(CONTAINER, name, contents).await;
    }

    pub fn start_workers(&self, loops: usize) -> RunningWorkers {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_pool(self.services.worker.clone(), loops, rx));
        RunningWorkers { tx, handle }
    }
}

pub struct RunningWorkers {
    tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RunningWorkers {
    pub async fn stop(self) {
        let _ = self.tx.send(true);
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("workers did not stop")
            .expect("worker pool panicked");
    }
}

/// Deterministic rows for file `index`, returned as text plus their fold
pub fn generated_file(index: usize, rows: usize) -> (String, Aggregates) {
    let stations = ["Abha", "Bulawayo", "Cabo San Lucas", "Dodoma", "Erzurum", "Fianarantsoa"];
    let mut text = String::new();
    let mut expected = Aggregates::new();

    for row in 0..rows {
        let name = stations[(index * 7 + row * 3) % stations.len()];
        let tenths = ((index * 131 + row * 37) % 1999) as i64 - 999;
        let sign = if tenths < 0 { "-" } else { "" };
        text.push_str(&format!(
            "{};{}{}.{}\n",
            name,
            sign,
            tenths.abs() / 10,
            tenths.abs() % 10
        ));
        expected
            .entry(GroupKey::from(name))
            .and_modify(|m: &mut Measurement| m.record(tenths))
            .or_insert_with(|| Measurement::new(tenths));
    }

    (text, expected)
}

/// Poll until the queue holds `count` dead letters
pub async fn wait_for_dead_letters(queue: &MemoryQueue, count: usize) -> Vec<DeadLetter> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let dead = queue.dead_letters().await;
        if dead.len() >= count || tokio::time::Instant::now() >= deadline {
            return dead;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until every published message has been acknowledged
pub async fn wait_for_drain(queue: &MemoryQueue) -> usize {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let pending = queue.pending().await;
        if pending == 0 || tokio::time::Instant::now() >= deadline {
            return pending;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
