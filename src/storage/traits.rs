//! Collaborator interfaces: object store, work queue, keyed store
//!
//! The pipeline only talks to these traits. Backends live in
//! `storage::backends` and are selected by `storage::factory`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::StorageResult;
use super::lock::LockBackend;
use crate::model::WorkItem;

/// Read-only shared input
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every object name in `container`, following pagination to the end
    async fn list(&self, container: &str) -> StorageResult<Vec<String>>;

    /// Full contents of one object
    async fn read(&self, container: &str, name: &str) -> StorageResult<Vec<u8>>;

    /// Backend name for logs
    fn backend_type(&self) -> &'static str;
}

/// One received message, unacknowledged until `ack`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue-assigned message id
    pub id: String,
    /// Raw payload; decoded by the worker so bad payloads can be dead-lettered
    pub payload: Vec<u8>,
    /// How many times this message has been delivered, starting at 1
    pub attempt: u32,
}

/// Why a message left the normal flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DeadLetterReason {
    /// Payload did not decode as a work item
    MalformedWorkItem,
    /// The file was merged, but some rows did not match the row grammar
    #[serde(rename_all = "camelCase")]
    MalformedRows { rejected: u64, first_offset: Option<usize> },
    /// The process record is gone (expired or never created)
    MissingRecord,
    /// The referenced object does not exist in the container
    MissingObject,
    /// The filename cannot name an object in the container
    InvalidObjectName,
    /// The object exists but cannot be read
    UnreadableObject,
    /// The stored process record does not decode
    CorruptRecord,
    /// Delivered too many times without succeeding
    DeliveryLimit { attempts: u32 },
}

/// Diagnostic entry published to the dead-letter path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: String,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub reason: DeadLetterReason,
    pub message: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Entry for a delivery, echoing its raw payload
    pub fn for_delivery(
        delivery: &Delivery,
        item: Option<&WorkItem>,
        reason: DeadLetterReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: delivery.id.clone(),
            payload: String::from_utf8_lossy(&delivery.payload).into_owned(),
            process_uuid: item.map(|i| i.process_uuid.clone()),
            filename: item.map(|i| i.filename.clone()),
            reason,
            message: message.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Work distribution with at-least-once delivery
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Publish and wait for the broker's confirmation
    async fn publish(&self, item: &WorkItem) -> StorageResult<String>;

    /// Wait a bounded time for the next delivery; `None` when nothing arrived
    async fn receive(&self) -> StorageResult<Option<Delivery>>;

    /// Acknowledge a delivery so it is never redelivered
    async fn ack(&self, delivery: &Delivery) -> StorageResult<()>;

    /// Give a delivery back for redelivery
    ///
    /// Backends without an explicit negative acknowledgment leave the message
    /// pending and rely on the visibility timeout.
    async fn nack(&self, delivery: &Delivery) -> StorageResult<()>;

    /// Route an entry to the dead-letter path
    async fn dead_letter(&self, entry: &DeadLetter) -> StorageResult<()>;

    /// Backend name for logs
    fn backend_type(&self) -> &'static str;
}

/// Shared keyed state plus the distributed lock guarding it
#[async_trait]
pub trait KeyedStore: LockBackend {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, expiring after `ttl`
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StorageResult<()>;

    /// Backend name for logs
    fn backend_type(&self) -> &'static str;
}
