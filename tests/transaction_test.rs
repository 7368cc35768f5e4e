use resilient_db::backend::{Fault, FaultPoint, MemoryBackend};
use resilient_db::db::{ConnectionManager, ManagerConfig, PoolConfig, TransactionState};
use resilient_db::error::{DbError, ErrorKind};
use resilient_db::models::{Capabilities, OperationKind, Statement};
use resilient_db::resilience::RetryPolicy;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn setup(backend: &MemoryBackend) -> ConnectionManager {
    let manager = ConnectionManager::new(ManagerConfig {
        retry: RetryPolicy {
            base_delay: Duration::from_millis(1),
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        },
        ..ManagerConfig::default()
    });
    manager
        .connect_with_factory(
            "ledger",
            Arc::new(backend.clone()),
            PoolConfig {
                min_size: 0,
                max_size: 2,
                ..PoolConfig::default()
            },
        )
        .await
        .unwrap();
    manager
}

fn entry(n: i64) -> Statement {
    Statement::new("entries").bind(json!({ "n": n }))
}

#[tokio::test]
async fn test_failure_mid_sequence_rolls_back_everything() {
    let backend = MemoryBackend::new("ledger");
    let manager = setup(&backend).await;
    backend.inject(FaultPoint::Execute, Fault::fatal().after(1));

    let err = manager
        .execute_transaction("ledger", vec![entry(1), entry(2), entry(3)], None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TransactionAborted);
    assert_eq!(err.operation(), Some(OperationKind::Transaction));
    assert_eq!(backend.count("entries"), 0);
    // Third statement never ran
    assert_eq!(backend.calls(FaultPoint::Execute), 2);

    let stats = manager.pool("ledger").await.unwrap().stats();
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.idle, 1);
}

#[tokio::test]
async fn test_statements_inside_transaction_are_not_retried() {
    let backend = MemoryBackend::new("ledger");
    let manager = setup(&backend).await;
    backend.inject(FaultPoint::Execute, Fault::transient().times(1));

    let mut tx = manager.transaction("ledger", None).await.unwrap();
    let err = tx.execute(entry(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransactionAborted);
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(backend.calls(FaultPoint::Execute), 1);
    match err.root() {
        DbError::TransactionAborted {
            transaction_id,
            cause,
        } => {
            assert_eq!(transaction_id, tx.id());
            assert_eq!(cause.kind(), ErrorKind::QueryExecution);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_commit_makes_writes_visible() {
    let backend = MemoryBackend::new("ledger");
    let manager = setup(&backend).await;

    let mut tx = manager.transaction("ledger", None).await.unwrap();
    tx.execute(entry(1)).await.unwrap();
    tx.execute(entry(2)).await.unwrap();

    // Visible inside the transaction only
    assert_eq!(tx.query(Statement::new("entries")).await.unwrap().len(), 2);
    assert!(
        manager
            .fetch_all("ledger", "entries", None)
            .await
            .unwrap()
            .is_empty()
    );

    tx.commit().await.unwrap();
    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(tx.statements().len(), 3);
    assert_eq!(
        manager.fetch_all("ledger", "entries", None).await.unwrap().len(),
        2
    );
    assert_eq!(manager.pool("ledger").await.unwrap().stats().busy, 0);
}

#[tokio::test]
async fn test_explicit_rollback_discards_writes() {
    let backend = MemoryBackend::new("ledger");
    let manager = setup(&backend).await;

    let mut tx = manager.transaction("ledger", None).await.unwrap();
    tx.execute(entry(1)).await.unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(backend.count("entries"), 0);
    let err = tx.execute(entry(2)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_rollback_to_savepoint() {
    let backend = MemoryBackend::new("ledger");
    let manager = setup(&backend).await;

    let mut tx = manager.transaction("ledger", None).await.unwrap();
    tx.execute(entry(1)).await.unwrap();
    tx.savepoint("before_second").await.unwrap();
    tx.execute(entry(2)).await.unwrap();
    tx.rollback_to("before_second").await.unwrap();
    tx.commit().await.unwrap();

    let rows = manager.fetch_all("ledger", "entries", None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["n"], json!(1));
}

#[tokio::test]
async fn test_unknown_savepoint_leaves_transaction_active() {
    let backend = MemoryBackend::new("ledger");
    let manager = setup(&backend).await;

    let mut tx = manager.transaction("ledger", None).await.unwrap();
    let err = tx.rollback_to("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(tx.state(), TransactionState::Active);
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_savepoint_without_capability() {
    let backend = MemoryBackend::new("ledger").with_capabilities(Capabilities {
        savepoints: false,
        ..Capabilities::default()
    });
    let manager = setup(&backend).await;

    let mut tx = manager.transaction("ledger", None).await.unwrap();
    tx.execute(entry(1)).await.unwrap();
    let err = tx.savepoint("sp").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert_eq!(tx.state(), TransactionState::Active);

    tx.commit().await.unwrap();
    assert_eq!(backend.count("entries"), 1);
}

#[tokio::test]
async fn test_begin_without_transaction_support() {
    let backend = MemoryBackend::new("ledger").with_capabilities(Capabilities {
        transactions: false,
        savepoints: false,
        resumable_cursors: false,
    });
    let manager = setup(&backend).await;

    let err = manager.transaction("ledger", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert_eq!(err.attempts(), Some(0));
    assert_eq!(backend.connections_opened(), 0);
}

#[tokio::test]
async fn test_begin_is_retried() {
    let backend = MemoryBackend::new("ledger");
    let manager = setup(&backend).await;
    backend.inject(FaultPoint::Begin, Fault::transient().times(1));

    let affected = manager
        .execute_transaction("ledger", vec![entry(1), entry(2)], None)
        .await
        .unwrap();
    assert_eq!(affected, vec![1, 1]);
    assert_eq!(backend.calls(FaultPoint::Begin), 2);
    assert_eq!(backend.count("entries"), 2);
}

#[tokio::test]
async fn test_failed_commit_aborts() {
    let backend = MemoryBackend::new("ledger");
    let manager = setup(&backend).await;
    backend.inject(FaultPoint::Commit, Fault::fatal());

    let mut tx = manager.transaction("ledger", None).await.unwrap();
    tx.execute(entry(1)).await.unwrap();
    let err = tx.commit().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransactionAborted);
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(backend.count("entries"), 0);
}

#[tokio::test]
async fn test_dropped_transaction_discards_connection() {
    let backend = MemoryBackend::new("ledger");
    let manager = setup(&backend).await;

    {
        let mut tx = manager.transaction("ledger", None).await.unwrap();
        tx.execute(entry(1)).await.unwrap();
    }

    assert_eq!(backend.count("entries"), 0);
    let stats = manager.pool("ledger").await.unwrap().stats();
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.discarded, 1);
}
