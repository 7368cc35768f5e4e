use resilient_db::backend::{Fault, FaultPoint, MemoryBackend};
use resilient_db::db::{
    BatchJob, ChunkStatus, ConnectionManager, ManagerConfig, PartialFailurePolicy, PoolConfig,
};
use resilient_db::error::{DbError, ErrorKind};
use resilient_db::models::{OperationKind, Record};
use resilient_db::resilience::RetryPolicy;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn rows(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            let mut record = Record::new();
            record.insert("id".into(), json!(i));
            record
        })
        .collect()
}

async fn setup(retry: RetryPolicy) -> (ConnectionManager, MemoryBackend) {
    let backend = MemoryBackend::new("bulk");
    let manager = ConnectionManager::new(ManagerConfig {
        retry,
        max_concurrent: 4,
        ..ManagerConfig::default()
    });
    manager
        .connect_with_factory(
            "bulk",
            Arc::new(backend.clone()),
            PoolConfig {
                min_size: 0,
                max_size: 4,
                ..PoolConfig::default()
            },
        )
        .await
        .unwrap();
    (manager, backend)
}

#[tokio::test]
async fn test_all_chunks_written() {
    let (manager, backend) = setup(RetryPolicy::no_retry()).await;
    let result = manager
        .bulk_insert("bulk", BatchJob::new("items", rows(25), 10), None)
        .await
        .unwrap();

    assert!(result.is_complete());
    assert_eq!(result.total_chunks, 3);
    assert_eq!(result.succeeded_count, 25);
    let sizes: Vec<usize> = result.outcomes.iter().map(|o| o.records).collect();
    assert_eq!(sizes, vec![10, 10, 5]);
    assert_eq!(backend.count("items"), 25);
    assert_eq!(backend.calls(FaultPoint::Insert), 3);
}

#[tokio::test]
async fn test_ordered_failure_skips_remaining_chunks() {
    let (manager, backend) = setup(RetryPolicy::no_retry()).await;
    backend.inject(FaultPoint::Insert, Fault::fatal().after(1));

    let result = manager
        .bulk_insert("bulk", BatchJob::new("items", rows(30), 10), None)
        .await
        .unwrap();

    assert_eq!(result.succeeded_count, 10);
    assert_eq!(result.failed_chunks, vec![1]);
    assert_eq!(result.skipped_chunks, vec![2]);
    assert!(!result.is_complete());
    assert!(matches!(
        result.outcomes[1].status,
        ChunkStatus::Failed {
            kind: ErrorKind::QueryExecution,
            attempts: 1,
            ..
        }
    ));
    assert_eq!(result.outcomes[2].status, ChunkStatus::Skipped);
    // Chunk 0 stays written
    assert_eq!(backend.count("items"), 10);
    assert_eq!(backend.calls(FaultPoint::Insert), 2);
}

#[tokio::test]
async fn test_unordered_attempts_every_chunk() {
    let (manager, backend) = setup(RetryPolicy::no_retry()).await;
    backend.inject(FaultPoint::Insert, Fault::fatal());

    let result = manager
        .bulk_insert(
            "bulk",
            BatchJob::new("items", rows(30), 10).ordered(false),
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.outcomes.len(), 3);
    assert_eq!(result.failed_chunks, vec![0, 1, 2]);
    assert!(result.skipped_chunks.is_empty());
    assert_eq!(result.succeeded_count, 0);
    assert_eq!(backend.calls(FaultPoint::Insert), 3);
}

#[tokio::test]
async fn test_unordered_partial_failure_keeps_other_chunks() {
    let (manager, backend) = setup(RetryPolicy::no_retry()).await;
    // Exactly one of the four chunks fails; which one depends on scheduling
    backend.inject(FaultPoint::Insert, Fault::fatal().after(2).times(1));

    let result = manager
        .bulk_insert(
            "bulk",
            BatchJob::new("items", rows(40), 10).ordered(false),
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.failed_chunks.len(), 1);
    assert_eq!(result.succeeded_count, 30);
    assert_eq!(backend.count("items"), 30);
    let indices: Vec<usize> = result.outcomes.iter().map(|o| o.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_transient_chunk_failure_is_retried() {
    let retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        jitter_factor: 0.0,
        ..RetryPolicy::default()
    };
    let (manager, backend) = setup(retry).await;
    backend.inject(FaultPoint::Insert, Fault::transient().after(1).times(1));

    let result = manager
        .bulk_insert("bulk", BatchJob::new("items", rows(20), 10), None)
        .await
        .unwrap();

    assert!(result.is_complete());
    assert_eq!(backend.count("items"), 20);
    assert_eq!(backend.calls(FaultPoint::Insert), 3);
}

#[tokio::test]
async fn test_fail_policy_raises_bulk_write() {
    let (manager, backend) = setup(RetryPolicy::no_retry()).await;
    backend.inject(FaultPoint::Insert, Fault::fatal().after(1));

    let err = manager
        .bulk_insert(
            "bulk",
            BatchJob::new("items", rows(30), 10).on_failure(PartialFailurePolicy::Fail),
            None,
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BulkWrite);
    assert_eq!(err.operation(), Some(OperationKind::Write));
    match err.root() {
        DbError::BulkWrite {
            succeeded,
            failed_chunks,
        } => {
            assert_eq!(*succeeded, 10);
            assert_eq!(failed_chunks, &vec![1]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_zero_batch_size_is_rejected() {
    let (manager, backend) = setup(RetryPolicy::no_retry()).await;
    let err = manager
        .bulk_insert("bulk", BatchJob::new("items", rows(5), 0), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(backend.calls(FaultPoint::Insert), 0);
}

#[tokio::test]
async fn test_empty_job_writes_nothing() {
    let (manager, backend) = setup(RetryPolicy::no_retry()).await;
    let result = manager
        .bulk_insert("bulk", BatchJob::new("items", Vec::new(), 10), None)
        .await
        .unwrap();
    assert_eq!(result.total_chunks, 0);
    assert!(result.is_complete());
    assert_eq!(backend.connections_opened(), 0);
}

#[tokio::test]
async fn test_insert_batched_uses_configured_batch_size() {
    let (manager, backend) = setup(RetryPolicy::no_retry()).await;
    let batch = manager.config().batch_size;
    let result = manager
        .insert_batched("bulk", "items", rows(batch + 1), true)
        .await
        .unwrap();
    assert_eq!(result.total_chunks, 2);
    assert_eq!(backend.count("items"), batch + 1);
}

#[tokio::test(start_paused = true)]
async fn test_unordered_chunks_in_flight_are_bounded() {
    let backend = MemoryBackend::new("bulk").with_latency(Duration::from_millis(10));
    let manager = ConnectionManager::new(ManagerConfig {
        retry: RetryPolicy::no_retry(),
        max_concurrent: 2,
        ..ManagerConfig::default()
    });
    manager
        .connect_with_factory(
            "bulk",
            Arc::new(backend.clone()),
            PoolConfig {
                min_size: 0,
                max_size: 8,
                ..PoolConfig::default()
            },
        )
        .await
        .unwrap();

    let result = manager
        .bulk_insert(
            "bulk",
            BatchJob::new("items", rows(100), 10).ordered(false),
            None,
        )
        .await
        .unwrap();

    assert!(result.is_complete());
    assert_eq!(result.total_chunks, 10);
    assert_eq!(backend.count("items"), 100);
    assert!(backend.peak_in_flight() <= 2);
    assert!(manager.pool("bulk").await.unwrap().stats().created <= 2);
}
