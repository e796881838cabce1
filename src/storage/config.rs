//! Backend configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Object store backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStoreBackend {
    /// Local directory tree (default)
    #[default]
    File,
    /// S3-compatible bucket
    S3,
    /// In-process map (for testing)
    Memory,
}

/// Queue backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// In-process queue (standalone mode and tests)
    #[default]
    Memory,
    /// Redis Streams consumer group
    Redis,
}

/// Keyed store backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map (standalone mode and tests)
    #[default]
    Memory,
    /// Redis keys with `SET NX PX` locks
    Redis,
}

/// Which runs a merge lock serializes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// One lock per process id; unrelated runs never contend
    #[default]
    PerProcess,
    /// One lock name shared by every run
    Global,
}

impl LockScope {
    /// Lock name guarding the record of `process_uuid`
    pub fn lock_name(&self, process_uuid: &str) -> String {
        match self {
            Self::PerProcess => format!("trc-lock:{}", process_uuid),
            Self::Global => "trc-mutex".to_string(),
        }
    }
}

/// Object store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub backend: ObjectStoreBackend,
    /// Bucket name (S3) or directory under `root` (file)
    pub container: String,
    /// Root directory for the file backend
    pub root: PathBuf,
    pub s3: S3Config,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            backend: ObjectStoreBackend::default(),
            container: "measurements".to_string(),
            root: PathBuf::from("data"),
            s3: S3Config::default(),
        }
    }
}

/// S3 connection settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Custom endpoint (MinIO, LocalStack)
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// Only list objects under this prefix
    pub prefix: Option<String>,
    pub force_path_style: bool,
}

/// Redis connection settings shared by the queue and the keyed store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL; select a database with a path, `redis://host/2`
    pub url: String,
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
        }
    }
}

/// Work queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// Stream work items are published to
    pub stream: String,
    /// Consumer group shared by all workers
    pub group: String,
    /// Consumer name; defaults to `<hostname>-<pid>`
    pub consumer: Option<String>,
    pub dead_letter_stream: String,
    /// How long one `receive` blocks before returning empty
    #[serde(with = "humantime_serde")]
    pub receive_timeout: Duration,
    /// Unacknowledged deliveries older than this are redelivered
    #[serde(with = "humantime_serde")]
    pub visibility_timeout: Duration,
    /// Deliveries after which a message is dead-lettered
    pub max_deliveries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            stream: "trc:work".to_string(),
            group: "trc-workers".to_string(),
            consumer: None,
            dead_letter_stream: "trc:dead-letter".to_string(),
            receive_timeout: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(30),
            max_deliveries: 5,
        }
    }
}

/// Keyed store and lock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Prepended to every record key
    pub key_prefix: String,
    /// Expiry of process records
    #[serde(with = "humantime_serde")]
    pub record_ttl: Duration,
    /// Expiry of a held merge lock, bounding a crashed holder
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,
    /// How long a merge step waits for the lock
    #[serde(with = "humantime_serde")]
    pub lock_wait: Duration,
    pub lock_scope: LockScope,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            key_prefix: String::new(),
            record_ttl: Duration::from_secs(3600),
            lock_ttl: Duration::from_secs(10),
            lock_wait: Duration::from_secs(5),
            lock_scope: LockScope::default(),
        }
    }
}

impl StoreConfig {
    /// Keyed store key of the record for `process_uuid`
    pub fn record_key(&self, process_uuid: &str) -> String {
        format!("{}{}", self.key_prefix, process_uuid)
    }
}
