//! End-to-end runs over in-memory backends with live worker loops

mod common;

use common::{generated_file, wait_for_dead_letters, wait_for_drain, Harness};
use std::time::Duration;
use trc_aggregator::model::{merge, Aggregates, GroupKey, Measurement, ProcessStatus, WorkItem};
use trc_aggregator::storage::{DeadLetterReason, LockScope, WorkQueue};

#[tokio::test]
async fn test_single_file_run_matches_reference() {
    let harness = Harness::new();
    harness.add_file("a.txt", "a;3.4\nb;-2.1\nb;5.0\n").await;
    let workers = harness.start_workers(1);

    let record = harness.services.orchestrator.trigger().await.unwrap();
    workers.stop().await;

    assert_eq!(record.status, ProcessStatus::Complete);
    assert_eq!(record.processed_count, 1);
    assert_eq!(
        record.result[&GroupKey::from("a")],
        Measurement { min: 34, max: 34, sum: 34, count: 1 }
    );
    assert_eq!(
        record.result[&GroupKey::from("b")],
        Measurement { min: -21, max: 50, sum: 29, count: 2 }
    );
}

#[tokio::test]
async fn test_concurrent_workers_produce_sequential_result() {
    let harness = Harness::new();
    let mut expected = Aggregates::new();
    for i in 0..24 {
        let (text, aggregate) = generated_file(i, 200);
        harness.add_file(&format!("part-{i:02}.txt"), &text).await;
        expected = merge(expected, aggregate);
    }
    let workers = harness.start_workers(4);

    let record = harness.services.orchestrator.trigger().await.unwrap();
    workers.stop().await;

    assert_eq!(record.status, ProcessStatus::Complete);
    assert_eq!(record.processed_count, 24);
    assert_eq!(record.result, expected);
}

#[tokio::test]
async fn test_duplicate_deliveries_are_merged_once() {
    let harness = Harness::new();
    let (text, expected) = generated_file(3, 50);
    harness.add_file("only.txt", &text).await;

    let orchestrator = harness.services.orchestrator.clone();
    let dispatched = orchestrator.dispatch("run-dup").await.unwrap();
    assert_eq!(dispatched, 1);
    for _ in 0..3 {
        harness
            .queue
            .publish(&WorkItem::new("run-dup", "only.txt"))
            .await
            .unwrap();
    }

    let workers = harness.start_workers(2);
    let record = orchestrator.wait("run-dup").await.unwrap();
    assert_eq!(wait_for_drain(&harness.queue).await, 0);
    workers.stop().await;

    assert_eq!(record.status, ProcessStatus::Complete);
    assert_eq!(record.processed_count, 1);
    assert_eq!(record.result, expected);

    let stored = orchestrator.records().load("run-dup").await.unwrap().unwrap();
    assert_eq!(stored.processed_count, 1);
    assert_eq!(stored.result, expected);
}

#[tokio::test]
async fn test_run_without_workers_times_out() {
    let mut config = common::test_config();
    config.orchestrator.timeout = Duration::from_millis(60);
    let harness = Harness::with_config(config);
    harness.add_file("a.txt", "a;1.0\n").await;

    let record = harness.services.orchestrator.trigger().await.unwrap();

    assert_eq!(record.status, ProcessStatus::TimedOut);
    assert_eq!(record.processed_count, 0);
    assert!(record.result.is_empty());

    // The stored record keeps its real status
    let stored = harness
        .services
        .orchestrator
        .records()
        .load(&record.process_uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, ProcessStatus::Processing);
}

#[tokio::test]
async fn test_empty_container_completes_immediately() {
    let harness = Harness::new();

    let record = harness.services.orchestrator.trigger().await.unwrap();

    assert_eq!(record.status, ProcessStatus::Complete);
    assert_eq!(record.processed_count, 0);
    assert!(record.result.is_empty());
}

#[tokio::test]
async fn test_concurrent_runs_stay_independent() {
    for scope in [LockScope::PerProcess, LockScope::Global] {
        let mut config = common::test_config();
        config.store.lock_scope = scope;
        let harness = Harness::with_config(config);

        let mut expected = Aggregates::new();
        for i in 0..8 {
            let (text, aggregate) = generated_file(i, 100);
            harness.add_file(&format!("f{i}"), &text).await;
            expected = merge(expected, aggregate);
        }
        let workers = harness.start_workers(3);

        let orchestrator = harness.services.orchestrator.clone();
        let (first, second) = tokio::join!(orchestrator.trigger(), orchestrator.trigger());
        workers.stop().await;

        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first.process_uuid, second.process_uuid);
        for record in [first, second] {
            assert_eq!(record.status, ProcessStatus::Complete, "scope {scope:?}");
            assert_eq!(record.processed_count, 8);
            assert_eq!(record.result, expected);
        }
    }
}

#[tokio::test]
async fn test_transient_store_failures_are_retried() {
    let harness = Harness::new();
    let (text, expected) = generated_file(1, 80);
    harness.add_file("a.txt", &text).await;
    harness.add_file("b.txt", "z;0.5\n").await;

    let orchestrator = harness.services.orchestrator.clone();
    orchestrator.dispatch("run-flaky").await.unwrap();
    harness.store.inject_failures(3);

    let workers = harness.start_workers(2);
    let record = orchestrator.wait("run-flaky").await.unwrap();
    workers.stop().await;

    assert_eq!(record.status, ProcessStatus::Complete);
    assert_eq!(record.processed_count, 2);
    let mut expected = expected;
    expected.insert(GroupKey::from("z"), Measurement::new(5));
    assert_eq!(record.result, expected);
}

#[tokio::test]
async fn test_malformed_rows_are_reported_and_valid_rows_kept() {
    let harness = Harness::new();
    harness
        .add_file("mixed.txt", "a;1.0\nbroken\na;2.0\nb;1.23\n")
        .await;
    let workers = harness.start_workers(1);

    let record = harness.services.orchestrator.trigger().await.unwrap();
    let dead = wait_for_dead_letters(&harness.queue, 1).await;
    workers.stop().await;

    assert_eq!(record.status, ProcessStatus::Complete);
    assert_eq!(
        record.result[&GroupKey::from("a")],
        Measurement { min: 10, max: 20, sum: 30, count: 2 }
    );
    assert!(!record.result.contains_key(&GroupKey::from("b")));

    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].filename.as_deref(), Some("mixed.txt"));
    assert!(matches!(
        dead[0].reason,
        DeadLetterReason::MalformedRows { rejected: 2, .. }
    ));
}

#[tokio::test]
async fn test_missing_object_is_dead_lettered() {
    let mut config = common::test_config();
    config.orchestrator.timeout = Duration::from_millis(300);
    let harness = Harness::with_config(config);
    harness.add_file("present.txt", "a;1.0\n").await;

    let orchestrator = harness.services.orchestrator.clone();
    orchestrator.dispatch("run-gone").await.unwrap();
    harness
        .queue
        .publish(&WorkItem::new("run-gone", "vanished.txt"))
        .await
        .unwrap();

    let workers = harness.start_workers(1);
    let record = orchestrator.wait("run-gone").await.unwrap();
    let dead = wait_for_dead_letters(&harness.queue, 1).await;
    workers.stop().await;

    // The stray item does not count towards completion
    assert_eq!(record.status, ProcessStatus::Complete);
    assert_eq!(record.processed_count, 1);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, DeadLetterReason::MissingObject);
    assert_eq!(dead[0].process_uuid.as_deref(), Some("run-gone"));
}
