//! Fan-out of one aggregation run and the wait for its completion

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::record::RecordStore;
use crate::error::{AggregatorError, ErrorClass, Result};
use crate::model::{ProcessRecord, WorkItem};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::storage::{ObjectStore, WorkQueue};

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Delay between record polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long the trigger waits for completion after dispatching
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Dispatches one work item per object and waits for the merged result
#[derive(Clone)]
pub struct Orchestrator {
    objects: Arc<dyn ObjectStore>,
    queue: Arc<dyn WorkQueue>,
    records: RecordStore,
    retry: RetryExecutor,
    config: OrchestratorConfig,
    container: String,
}

impl Orchestrator {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        queue: Arc<dyn WorkQueue>,
        records: RecordStore,
        retry: RetryConfig,
        config: OrchestratorConfig,
        container: impl Into<String>,
    ) -> Self {
        Self {
            objects,
            queue,
            records,
            retry: RetryExecutor::new(retry),
            config,
            container: container.into(),
        }
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Start a run and wait for it, returning the record as reported to callers
    pub async fn trigger(&self) -> Result<ProcessRecord> {
        let process_uuid = Uuid::new_v4().to_string();
        let dispatched = self.dispatch(&process_uuid).await?;
        info!(process_id = %process_uuid, dispatched, "Dispatched run");
        self.wait(&process_uuid).await
    }

    /// Create the record, publish one work item per object, then record the total
    pub async fn dispatch(&self, process_uuid: &str) -> Result<u64> {
        self.records.save(&ProcessRecord::new(process_uuid)).await?;

        let container = self.container.as_str();
        let names = self
            .retry
            .execute_with_retry(|| self.objects.list(container), "object listing")
            .await?;

        let mut published = 0u64;
        for name in &names {
            let item = WorkItem::new(process_uuid, name.as_str());
            let id = self
                .retry
                .execute_with_retry(|| self.queue.publish(&item), "work item publish")
                .await?;
            debug!(process_id = process_uuid, filename = %name, message_id = %id, "Published work item");
            published += 1;
        }

        self.records
            .update(process_uuid, |record| record.set_expected(published))
            .await?;
        Ok(published)
    }

    /// Poll the record until it completes or the timeout elapses
    pub async fn wait(&self, process_uuid: &str) -> Result<ProcessRecord> {
        let deadline = Instant::now() + self.config.timeout;
        let mut latest: Option<ProcessRecord> = None;
        let mut last_error: Option<AggregatorError> = None;

        loop {
            match self.records.peek(process_uuid).await {
                Ok(Some(record)) if record.is_complete() => {
                    info!(
                        process_id = process_uuid,
                        processed = record.processed_count,
                        groups = record.result.len(),
                        "Run complete"
                    );
                    return Ok(record.into_response(false));
                }
                Ok(Some(record)) => latest = Some(record),
                Ok(None) => {
                    return Err(AggregatorError::RecordNotFound(process_uuid.to_string()))
                }
                Err(e) if e.class() == ErrorClass::Transient => {
                    warn!(process_id = process_uuid, "Record poll failed: {}", e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }

        match (latest, last_error) {
            (Some(record), _) => {
                warn!(
                    process_id = process_uuid,
                    processed = record.processed_count,
                    expected = ?record.expected_count,
                    "Run timed out"
                );
                Ok(record.into_response(true))
            }
            (None, Some(e)) => Err(e),
            (None, None) => Err(AggregatorError::RecordNotFound(process_uuid.to_string())),
        }
    }
}
