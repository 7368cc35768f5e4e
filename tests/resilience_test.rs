use resilient_db::backend::{Fault, FaultPoint, MemoryBackend};
use resilient_db::db::{ConnectionManager, ManagerConfig, PoolConfig};
use resilient_db::error::ErrorKind;
use resilient_db::models::OperationKind;
use resilient_db::resilience::{CircuitBreakerConfig, CircuitRegistry, CircuitState, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;

fn retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        jitter_factor: 0.0,
        ..RetryPolicy::default()
    }
}

fn breaker(failure_threshold: u32, success_threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        success_threshold,
        cooldown: Duration::from_secs(10),
        half_open_max_probes: 1,
    }
}

async fn connected(config: ManagerConfig, backend: &MemoryBackend) -> ConnectionManager {
    let manager = ConnectionManager::new(config);
    attach(&manager, backend).await;
    manager
}

async fn attach(manager: &ConnectionManager, backend: &MemoryBackend) {
    manager
        .connect_with_factory(
            "docs",
            Arc::new(backend.clone()),
            PoolConfig {
                min_size: 0,
                ..PoolConfig::default()
            },
        )
        .await
        .unwrap();
}

fn config(retry: RetryPolicy, breaker: CircuitBreakerConfig) -> ManagerConfig {
    ManagerConfig {
        retry,
        breaker,
        ..ManagerConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_after_exactly_threshold_failures() {
    let backend = MemoryBackend::new("threshold");
    let manager = connected(config(RetryPolicy::no_retry(), breaker(3, 1)), &backend).await;
    backend.inject(FaultPoint::Query, Fault::transient());
    let circuit = manager.circuits().breaker("docs");

    for _ in 0..2 {
        let err = manager.fetch_all("docs", "users", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryExecution);
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    let err = manager.fetch_all("docs", "users", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueryExecution);
    assert_eq!(circuit.state(), CircuitState::Open);

    let err = manager.fetch_all("docs", "users", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    assert_eq!(err.attempts(), Some(0));
    assert_eq!(backend.calls(FaultPoint::Query), 3);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_reverts_on_first_failure() {
    let backend = MemoryBackend::new("half-open");
    let manager = connected(config(RetryPolicy::no_retry(), breaker(1, 3)), &backend).await;
    let circuit = manager.circuits().breaker("docs");

    backend.inject(FaultPoint::Query, Fault::transient());
    assert!(manager.fetch_all("docs", "users", None).await.is_err());
    assert_eq!(circuit.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(10)).await;
    backend.clear_faults();
    manager.fetch_all("docs", "users", None).await.unwrap();
    manager.fetch_all("docs", "users", None).await.unwrap();
    assert_eq!(circuit.state(), CircuitState::HalfOpen);
    assert_eq!(circuit.snapshot().success_count, 2);

    backend.inject(FaultPoint::Query, Fault::transient());
    assert!(manager.fetch_all("docs", "users", None).await.is_err());
    assert_eq!(circuit.state(), CircuitState::Open);

    let err = manager.fetch_all("docs", "users", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_closes_after_success_threshold() {
    let backend = MemoryBackend::new("recover");
    let manager = connected(config(RetryPolicy::no_retry(), breaker(1, 2)), &backend).await;
    let circuit = manager.circuits().breaker("docs");

    backend.inject(FaultPoint::Query, Fault::transient().times(1));
    assert!(manager.fetch_all("docs", "users", None).await.is_err());
    tokio::time::advance(Duration::from_secs(10)).await;

    manager.fetch_all("docs", "users", None).await.unwrap();
    manager.fetch_all("docs", "users", None).await.unwrap();
    let snapshot = circuit.snapshot();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.failure_count, 0);
    assert_eq!(snapshot.success_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let backend = MemoryBackend::new("retry");
    let manager = connected(config(retry(3), breaker(5, 1)), &backend).await;
    backend.inject(FaultPoint::Query, Fault::transient().times(2));

    manager.fetch_all("docs", "users", None).await.unwrap();
    assert_eq!(backend.calls(FaultPoint::Query), 3);
    let snapshot = manager.circuits().breaker("docs").snapshot();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_report_attempts() {
    let backend = MemoryBackend::new("exhausted");
    let manager = connected(config(retry(3), breaker(10, 1)), &backend).await;
    backend.inject(FaultPoint::Execute, Fault::transient());

    let err = manager
        .execute_query("docs", "users", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueryExecution);
    assert_eq!(err.attempts(), Some(3));
    assert_eq!(err.target(), Some("docs"));
    assert_eq!(err.operation(), Some(OperationKind::Write));
    assert_eq!(backend.calls(FaultPoint::Execute), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_errors_are_not_retried_or_counted() {
    let backend = MemoryBackend::new("fatal");
    let manager = connected(config(retry(5), breaker(1, 1)), &backend).await;
    backend.inject(FaultPoint::Query, Fault::fatal());

    let err = manager.fetch_all("docs", "users", None).await.unwrap_err();
    assert_eq!(err.attempts(), Some(1));
    assert!(!err.is_retryable());
    assert_eq!(backend.calls(FaultPoint::Query), 1);
    assert_eq!(
        manager.circuits().breaker("docs").state(),
        CircuitState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn test_circuit_state_is_shared_through_registry() {
    let registry = Arc::new(CircuitRegistry::new(breaker(1, 1)));
    let backend = MemoryBackend::new("shared");

    let first = ConnectionManager::with_registry(
        config(RetryPolicy::no_retry(), breaker(1, 1)),
        Arc::clone(&registry),
    );
    let second = ConnectionManager::with_registry(
        config(RetryPolicy::no_retry(), breaker(1, 1)),
        Arc::clone(&registry),
    );
    attach(&first, &backend).await;
    attach(&second, &backend).await;

    backend.inject(FaultPoint::Query, Fault::transient().times(1));
    assert!(first.fetch_all("docs", "users", None).await.is_err());

    let err = second.fetch_all("docs", "users", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);
}

#[tokio::test(start_paused = true)]
async fn test_operation_timeout_is_transient() {
    let backend = MemoryBackend::new("slow").with_latency(Duration::from_secs(5));
    let manager = connected(
        ManagerConfig {
            operation_timeout: Some(Duration::from_secs(1)),
            ..config(retry(2), breaker(10, 1))
        },
        &backend,
    )
    .await;

    let err = manager.fetch_all("docs", "users", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.attempts(), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_pool_saturation_does_not_open_circuit() {
    let backend = MemoryBackend::new("saturated");
    let manager = ConnectionManager::new(config(RetryPolicy::no_retry(), breaker(3, 1)));
    manager
        .connect_with_factory(
            "docs",
            Arc::new(backend.clone()),
            PoolConfig {
                min_size: 0,
                max_size: 1,
                acquire_timeout: Duration::from_millis(10),
                ..PoolConfig::default()
            },
        )
        .await
        .unwrap();
    let circuit = manager.circuits().breaker("docs");

    let held = manager.acquire("docs", None).await.unwrap();
    for _ in 0..3 {
        let err = manager.fetch_all("docs", "users", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolTimeout);
    }
    assert_eq!(circuit.state(), CircuitState::Closed);
    assert_eq!(circuit.snapshot().failure_count, 0);

    drop(held);
    manager.fetch_all("docs", "users", None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_caller_deadline_does_not_open_circuit() {
    let backend = MemoryBackend::new("impatient").with_latency(Duration::from_millis(50));
    let manager = connected(config(RetryPolicy::no_retry(), breaker(2, 1)), &backend).await;
    let circuit = manager.circuits().breaker("docs");
    // Warm one connection so only the query runs into the deadline
    drop(manager.acquire("docs", None).await.unwrap());

    for _ in 0..2 {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(10);
        let err = manager
            .fetch_all("docs", "users", Some(deadline))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
    assert_eq!(circuit.state(), CircuitState::Closed);
    manager.fetch_all("docs", "users", None).await.unwrap();
}
