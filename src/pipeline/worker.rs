//! Worker merge loop: receive, reduce, merge under the lock, acknowledge

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::record::RecordStore;
use crate::aggregate::{FileReducer, FileReport};
use crate::error::{AggregatorError, ErrorClass, Result};
use crate::model::{MergeOutcome, WorkItem};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::storage::{
    DeadLetter, DeadLetterReason, Delivery, ObjectStore, StorageError, WorkQueue,
};

/// Worker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Merge loops per process
    pub concurrency: usize,
    /// Parse tasks per file; defaults to the available cores
    pub parallelism: Option<usize>,
    /// Pause after a failed receive
    #[serde(with = "humantime_serde")]
    pub idle_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            parallelism: None,
            idle_backoff: Duration::from_millis(200),
        }
    }
}

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The file was merged into its record
    Merged { rejected_rows: u64 },
    /// The file had been merged already; acknowledged without changes
    Duplicate,
    /// Retrying cannot help; routed to the dead-letter path and acknowledged
    DeadLettered(DeadLetterReason),
    /// Left unacknowledged for redelivery
    Requeued,
}

/// Stateless consumer of work items
pub struct Worker {
    objects: Arc<dyn ObjectStore>,
    queue: Arc<dyn WorkQueue>,
    records: RecordStore,
    reducer: FileReducer,
    retry: RetryExecutor,
    container: String,
    max_deliveries: u32,
    idle_backoff: Duration,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        queue: Arc<dyn WorkQueue>,
        records: RecordStore,
        retry: RetryConfig,
        config: &WorkerConfig,
        container: impl Into<String>,
        max_deliveries: u32,
    ) -> Self {
        let reducer = config
            .parallelism
            .map(FileReducer::new)
            .unwrap_or_else(FileReducer::with_available_parallelism);
        Self {
            objects,
            queue,
            records,
            reducer,
            retry: RetryExecutor::new(retry),
            container: container.into(),
            max_deliveries,
            idle_backoff: config.idle_backoff,
        }
    }

    /// Receive and handle at most one delivery; `None` when the queue was idle
    pub async fn process_next(&self) -> Result<Option<Outcome>> {
        match self.queue.receive().await? {
            Some(delivery) => self.handle(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Handle one delivery to the point of ack, nack or dead-letter
    pub async fn handle(&self, delivery: Delivery) -> Result<Outcome> {
        let item: WorkItem = match serde_json::from_slice(&delivery.payload) {
            Ok(item) => item,
            Err(e) => {
                warn!(id = %delivery.id, "Undecodable work item: {}", e);
                return self
                    .reject(&delivery, None, DeadLetterReason::MalformedWorkItem, e.to_string())
                    .await;
            }
        };

        if delivery.attempt > self.max_deliveries {
            if self.already_merged(&item).await {
                debug!(
                    process_id = %item.process_uuid,
                    filename = %item.filename,
                    attempts = delivery.attempt,
                    "Over the delivery limit but already merged"
                );
                self.retry
                    .execute_with_retry(|| self.queue.ack(&delivery), "ack")
                    .await?;
                return Ok(Outcome::Duplicate);
            }
            warn!(
                process_id = %item.process_uuid,
                filename = %item.filename,
                attempts = delivery.attempt,
                "Delivery limit exceeded"
            );
            let reason = DeadLetterReason::DeliveryLimit {
                attempts: delivery.attempt,
            };
            let message = format!("Gave up after {} deliveries", delivery.attempt);
            return self.reject(&delivery, Some(&item), reason, message).await;
        }

        match self.merge_file(&item).await {
            Ok(outcome) => {
                self.retry
                    .execute_with_retry(|| self.queue.ack(&delivery), "ack")
                    .await?;
                Ok(outcome)
            }
            Err(e) => match e.class() {
                ErrorClass::Malformed => {
                    warn!(
                        process_id = %item.process_uuid,
                        filename = %item.filename,
                        "Dead-lettering work item: {}",
                        e
                    );
                    let reason = dead_letter_reason(&e);
                    self.reject(&delivery, Some(&item), reason, e.to_string())
                        .await
                }
                ErrorClass::Transient | ErrorClass::Lock => {
                    warn!(
                        process_id = %item.process_uuid,
                        filename = %item.filename,
                        attempt = delivery.attempt,
                        "Merge failed, leaving for redelivery: {}",
                        e
                    );
                    self.queue.nack(&delivery).await?;
                    Ok(Outcome::Requeued)
                }
                ErrorClass::Fatal => {
                    if let Err(nack_err) = self.queue.nack(&delivery).await {
                        warn!(id = %delivery.id, "Failed to nack: {}", nack_err);
                    }
                    Err(e)
                }
            },
        }
    }

    async fn merge_file(&self, item: &WorkItem) -> Result<Outcome> {
        let container = self.container.as_str();
        let bytes = self
            .retry
            .execute_with_retry(|| self.objects.read(container, &item.filename), "object read")
            .await
            .map_err(|e| read_error(container, &item.filename, e))?;

        let reducer = self.reducer;
        let report: FileReport = tokio::task::spawn_blocking(move || reducer.reduce(&bytes))
            .await
            .map_err(|e| AggregatorError::Task(e.to_string()))?;

        debug!(
            process_id = %item.process_uuid,
            filename = %item.filename,
            rows = report.rows,
            groups = report.aggregate.len(),
            "Reduced file"
        );

        let FileReport {
            aggregate,
            rejected,
            first_rejected_offset,
            ..
        } = report;
        let filename = item.filename.clone();
        let merged = self
            .records
            .update(&item.process_uuid, move |record| {
                record.apply_file(&filename, aggregate)
            })
            .await?;

        match merged {
            MergeOutcome::Merged => {
                info!(
                    process_id = %item.process_uuid,
                    filename = %item.filename,
                    "Merged file"
                );
                if rejected > 0 {
                    self.report_rejected_rows(item, rejected, first_rejected_offset)
                        .await;
                }
                Ok(Outcome::Merged {
                    rejected_rows: rejected,
                })
            }
            MergeOutcome::Duplicate => {
                debug!(
                    process_id = %item.process_uuid,
                    filename = %item.filename,
                    "File already merged"
                );
                Ok(Outcome::Duplicate)
            }
        }
    }

    /// Whether the record already counts this file; lookup failures count as no
    async fn already_merged(&self, item: &WorkItem) -> bool {
        match self.records.peek(&item.process_uuid).await {
            Ok(Some(record)) => record.merged_files.contains(&item.filename),
            Ok(None) => false,
            Err(e) => {
                warn!(process_id = %item.process_uuid, "Record lookup failed: {}", e);
                false
            }
        }
    }

    /// Publish a diagnostic for skipped rows; the merge already succeeded
    async fn report_rejected_rows(&self, item: &WorkItem, rejected: u64, first: Option<usize>) {
        warn!(
            process_id = %item.process_uuid,
            filename = %item.filename,
            rejected,
            first_offset = ?first,
            "Skipped malformed rows"
        );
        let entry = DeadLetter {
            id: format!("{}/{}", item.process_uuid, item.filename),
            payload: serde_json::to_string(item).unwrap_or_default(),
            process_uuid: Some(item.process_uuid.clone()),
            filename: Some(item.filename.clone()),
            reason: DeadLetterReason::MalformedRows {
                rejected,
                first_offset: first,
            },
            message: format!("{} malformed rows skipped", rejected),
            dead_lettered_at: chrono::Utc::now(),
        };
        if let Err(e) = self.queue.dead_letter(&entry).await {
            warn!(filename = %item.filename, "Failed to publish row diagnostic: {}", e);
        }
    }

    async fn reject(
        &self,
        delivery: &Delivery,
        item: Option<&WorkItem>,
        reason: DeadLetterReason,
        message: String,
    ) -> Result<Outcome> {
        let entry = DeadLetter::for_delivery(delivery, item, reason.clone(), message);
        self.retry
            .execute_with_retry(|| self.queue.dead_letter(&entry), "dead-letter publish")
            .await?;
        self.retry
            .execute_with_retry(|| self.queue.ack(delivery), "ack")
            .await?;
        Ok(Outcome::DeadLettered(reason))
    }

    /// Run the merge loop until `shutdown` flips or its sender is dropped
    ///
    /// A delivery already received is always handled to completion.
    pub async fn run(&self, loop_id: usize, mut shutdown: watch::Receiver<bool>) {
        info!(loop_id, queue = self.queue.backend_type(), "Worker loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.queue.receive() => received,
            };

            let result = match received {
                Ok(Some(delivery)) => self.handle(delivery).await.map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(AggregatorError::from(e)),
            };

            match result {
                Ok(_) => {}
                Err(e) if e.class() == ErrorClass::Fatal => {
                    error!(loop_id, "Worker loop stopping: {}", e);
                    break;
                }
                Err(e) => {
                    warn!(loop_id, "Worker loop error: {}", e);
                    tokio::time::sleep(self.idle_backoff).await;
                }
            }
        }

        info!(loop_id, "Worker loop stopped");
    }
}

/// Failed object read as a pipeline error; only retryable failures stay transient
fn read_error(container: &str, filename: &str, error: StorageError) -> AggregatorError {
    let name = format!("{}/{}", container, filename);
    if error.is_retryable() {
        AggregatorError::Storage(error)
    } else if error.is_not_found() {
        AggregatorError::ObjectNotFound(name)
    } else if error.is_invalid_name() {
        AggregatorError::InvalidObjectName(filename.to_string())
    } else {
        AggregatorError::UnreadableObject {
            name,
            message: error.to_string(),
        }
    }
}

fn dead_letter_reason(error: &AggregatorError) -> DeadLetterReason {
    match error {
        AggregatorError::RecordNotFound(_) => DeadLetterReason::MissingRecord,
        AggregatorError::CorruptRecord { .. } => DeadLetterReason::CorruptRecord,
        AggregatorError::ObjectNotFound(_) => DeadLetterReason::MissingObject,
        AggregatorError::InvalidObjectName(_) => DeadLetterReason::InvalidObjectName,
        AggregatorError::UnreadableObject { .. } => DeadLetterReason::UnreadableObject,
        AggregatorError::Storage(e) if e.is_not_found() => DeadLetterReason::MissingObject,
        AggregatorError::Storage(e) if e.is_invalid_name() => DeadLetterReason::InvalidObjectName,
        _ => DeadLetterReason::MalformedWorkItem,
    }
}

/// Run `concurrency` merge loops sharing one worker until shutdown
pub async fn run_pool(worker: Arc<Worker>, concurrency: usize, shutdown: watch::Receiver<bool>) {
    let handles: Vec<_> = (0..concurrency.max(1))
        .map(|loop_id| {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(loop_id, shutdown).await })
        })
        .collect();

    for handle in futures::future::join_all(handles).await {
        if let Err(e) = handle {
            error!("Worker loop panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GroupKey, Measurement, ProcessRecord, ProcessStatus};
    use crate::storage::backends::{FileObjectStore, MemoryObjectStore, MemoryQueue, MemoryStore};
    use crate::storage::StoreConfig;

    struct Fixture {
        objects: Arc<MemoryObjectStore>,
        queue: Arc<MemoryQueue>,
        records: RecordStore,
        worker: Worker,
    }

    fn fixture() -> Fixture {
        let objects = Arc::new(MemoryObjectStore::new());
        let (queue, records, worker) = build(objects.clone());
        Fixture {
            objects,
            queue,
            records,
            worker,
        }
    }

    fn build(objects: Arc<dyn ObjectStore>) -> (Arc<MemoryQueue>, RecordStore, Worker) {
        let queue = Arc::new(MemoryQueue::new(
            Duration::from_millis(20),
            Duration::from_secs(30),
        ));
        let store = Arc::new(MemoryStore::new());
        let retry = RetryConfig {
            attempts: 2,
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        };
        let records = RecordStore::new(
            store.clone(),
            store,
            "worker",
            StoreConfig::default(),
            retry.clone(),
        );
        let config = WorkerConfig {
            parallelism: Some(2),
            ..Default::default()
        };
        let worker = Worker::new(
            objects,
            queue.clone(),
            records.clone(),
            retry,
            &config,
            "bucket",
            3,
        );
        (queue, records, worker)
    }

    async fn expect_one(f: &Fixture, process: &str) {
        let mut record = ProcessRecord::new(process);
        record.set_expected(1);
        f.records.save(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_merges_file_and_completes_record() {
        let f = fixture();
        f.objects.insert("bucket", "a.txt", "a;3.4\nb;-2.1\nb;5.0\n").await;
        expect_one(&f, "p").await;
        f.queue.publish(&WorkItem::new("p", "a.txt")).await.unwrap();

        let outcome = f.worker.process_next().await.unwrap();
        assert_eq!(outcome, Some(Outcome::Merged { rejected_rows: 0 }));
        assert_eq!(f.queue.pending().await, 0);

        let record = f.records.load("p").await.unwrap().unwrap();
        assert_eq!(record.status, ProcessStatus::Complete);
        let b = &record.result[&GroupKey::from("b")];
        assert_eq!((b.min, b.max, b.sum, b.count), (-21, 50, 29, 2));
    }

    #[tokio::test]
    async fn test_idle_queue_returns_none() {
        let f = fixture();
        assert_eq!(f.worker.process_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_redelivery_is_not_double_counted() {
        let f = fixture();
        f.objects.insert("bucket", "a.txt", "a;1.0\n").await;
        let mut record = ProcessRecord::new("p");
        record.set_expected(2);
        f.records.save(&record).await.unwrap();

        f.queue.publish(&WorkItem::new("p", "a.txt")).await.unwrap();
        f.queue.publish(&WorkItem::new("p", "a.txt")).await.unwrap();

        assert!(matches!(
            f.worker.process_next().await.unwrap(),
            Some(Outcome::Merged { .. })
        ));
        assert_eq!(f.worker.process_next().await.unwrap(), Some(Outcome::Duplicate));

        let record = f.records.load("p").await.unwrap().unwrap();
        assert_eq!(record.processed_count, 1);
        assert_eq!(record.result[&GroupKey::from("a")].count, 1);
        assert_eq!(record.status, ProcessStatus::Processing);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dead_lettered() {
        let f = fixture();
        f.queue.publish_raw("not json").await;

        let outcome = f.worker.process_next().await.unwrap();
        assert_eq!(
            outcome,
            Some(Outcome::DeadLettered(DeadLetterReason::MalformedWorkItem))
        );
        assert_eq!(f.queue.pending().await, 0);

        let letters = f.queue.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].payload, "not json");
    }

    #[tokio::test]
    async fn test_missing_record_is_dead_lettered() {
        let f = fixture();
        f.objects.insert("bucket", "a.txt", "a;1.0\n").await;
        f.queue.publish(&WorkItem::new("expired", "a.txt")).await.unwrap();

        let outcome = f.worker.process_next().await.unwrap();
        assert_eq!(
            outcome,
            Some(Outcome::DeadLettered(DeadLetterReason::MissingRecord))
        );
        assert_eq!(f.queue.pending().await, 0);
    }

    #[tokio::test]
    async fn test_missing_object_is_dead_lettered() {
        let f = fixture();
        expect_one(&f, "p").await;
        f.queue.publish(&WorkItem::new("p", "gone.txt")).await.unwrap();

        let outcome = f.worker.process_next().await.unwrap();
        assert_eq!(
            outcome,
            Some(Outcome::DeadLettered(DeadLetterReason::MissingObject))
        );
        let letters = f.queue.dead_letters().await;
        assert_eq!(letters[0].filename.as_deref(), Some("gone.txt"));
    }

    #[tokio::test]
    async fn test_malformed_rows_are_merged_and_reported() {
        let f = fixture();
        f.objects
            .insert("bucket", "a.txt", "a;1.0\nbroken\na;2.0\n")
            .await;
        expect_one(&f, "p").await;
        f.queue.publish(&WorkItem::new("p", "a.txt")).await.unwrap();

        let outcome = f.worker.process_next().await.unwrap();
        assert_eq!(outcome, Some(Outcome::Merged { rejected_rows: 1 }));

        let record = f.records.load("p").await.unwrap().unwrap();
        assert_eq!(record.result[&GroupKey::from("a")].count, 2);

        let letters = f.queue.dead_letters().await;
        assert_eq!(
            letters[0].reason,
            DeadLetterReason::MalformedRows {
                rejected: 1,
                first_offset: Some(6)
            }
        );
    }

    #[tokio::test]
    async fn test_transient_read_failure_requeues() {
        let f = fixture();
        f.objects.insert("bucket", "a.txt", "a;1.0\n").await;
        expect_one(&f, "p").await;
        f.queue.publish(&WorkItem::new("p", "a.txt")).await.unwrap();
        f.objects.inject_failures(2);

        assert_eq!(f.worker.process_next().await.unwrap(), Some(Outcome::Requeued));
        assert_eq!(f.queue.pending().await, 1);

        assert!(matches!(
            f.worker.process_next().await.unwrap(),
            Some(Outcome::Merged { .. })
        ));
    }

    #[tokio::test]
    async fn test_delivery_limit_dead_letters() {
        let f = fixture();
        f.objects.insert("bucket", "a.txt", "a;1.0\n").await;
        expect_one(&f, "p").await;
        f.queue.publish(&WorkItem::new("p", "a.txt")).await.unwrap();
        f.objects.inject_failures(100);

        for _ in 0..3 {
            assert_eq!(f.worker.process_next().await.unwrap(), Some(Outcome::Requeued));
        }
        assert_eq!(
            f.worker.process_next().await.unwrap(),
            Some(Outcome::DeadLettered(DeadLetterReason::DeliveryLimit {
                attempts: 4
            }))
        );
        assert_eq!(f.queue.pending().await, 0);
    }

    #[tokio::test]
    async fn test_escaping_filename_is_dead_lettered_and_loop_survives() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("bucket")).unwrap();
        std::fs::write(dir.path().join("bucket/a.txt"), "a;1.5\n").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "s;9.9\n").unwrap();
        let (queue, records, worker) = build(Arc::new(FileObjectStore::new(dir.path())));

        let mut record = ProcessRecord::new("p");
        record.set_expected(1);
        records.save(&record).await.unwrap();

        queue.publish(&WorkItem::new("p", "../secret.txt")).await.unwrap();
        assert_eq!(
            worker.process_next().await.unwrap(),
            Some(Outcome::DeadLettered(DeadLetterReason::InvalidObjectName))
        );
        assert_eq!(queue.pending().await, 0);
        let letters = queue.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].filename.as_deref(), Some("../secret.txt"));

        // The loop keeps consuming past further bad names
        let worker = Arc::new(worker);
        let (tx, rx) = watch::channel(false);
        let looped = worker.clone();
        let handle = tokio::spawn(async move { looped.run(0, rx).await });
        queue.publish(&WorkItem::new("p", "/etc/passwd")).await.unwrap();
        queue.publish(&WorkItem::new("p", "a.txt")).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let record = records.load("p").await.unwrap().unwrap();
            if record.is_complete() {
                assert_eq!(record.result[&GroupKey::from("a")].sum, 15);
                assert!(!record.result.contains_key(&GroupKey::from("s")));
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "file was never merged");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!handle.is_finished());
        assert_eq!(queue.dead_letters().await.len(), 2);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_permanent_read_errors_are_not_fatal() {
        let cases = [
            StorageError::not_found("bucket/a"),
            StorageError::invalid_name("../a"),
            StorageError::serialization("bad"),
            StorageError::configuration("bad"),
            StorageError::conflict("held"),
        ];
        for error in cases {
            let mapped = read_error("bucket", "a", error);
            assert_eq!(mapped.class(), ErrorClass::Malformed, "{mapped}");
        }
        let transient = read_error("bucket", "a", StorageError::connection("reset"));
        assert_eq!(transient.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn test_merged_file_over_delivery_limit_is_acked_as_duplicate() {
        let f = fixture();
        f.objects.insert("bucket", "a.txt", "a;1.0\n").await;
        let mut record = ProcessRecord::new("p");
        record.set_expected(2);
        let aggregate = [(GroupKey::from("a"), Measurement::new(10))].into_iter().collect();
        record.apply_file("a.txt", aggregate);
        f.records.save(&record).await.unwrap();
        f.queue.publish(&WorkItem::new("p", "a.txt")).await.unwrap();

        // Earlier deliveries merged the file but never got acknowledged
        for _ in 0..3 {
            let delivery = f.queue.receive().await.unwrap().unwrap();
            f.queue.nack(&delivery).await.unwrap();
        }

        assert_eq!(f.worker.process_next().await.unwrap(), Some(Outcome::Duplicate));
        assert_eq!(f.queue.pending().await, 0);
        assert!(f.queue.dead_letters().await.is_empty());
        let record = f.records.load("p").await.unwrap().unwrap();
        assert_eq!(record.processed_count, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let worker = Arc::new(f.worker);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_pool(worker, 2, rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
