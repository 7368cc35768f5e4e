//! Resilience engine: circuit admission, per-attempt timeouts and retry with
//! backoff around any operation that touches a target.

use super::circuit::{CircuitRegistry, Outcome};
use super::retry::RetryPolicy;
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::OperationKind;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Earliest of an optional per-attempt timeout and an optional caller deadline.
pub fn effective_deadline(
    start: Instant,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
) -> Option<Instant> {
    let by_timeout = timeout.map(|t| start + t);
    match (by_timeout, deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Run `fut` until `deadline`, mapping expiry to a `Timeout` error.
pub async fn with_deadline<T, F>(operation: &str, deadline: Option<Instant>, fut: F) -> DbResult<T>
where
    F: Future<Output = DbResult<T>>,
{
    let Some(deadline) = deadline else {
        return fut.await;
    };
    let start = Instant::now();
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(DbError::timeout(
            operation,
            start.elapsed().as_millis() as u64,
        )),
    }
}

/// What a failed attempt tells the circuit about target health.
///
/// Pool saturation and expiry of the caller's own deadline are neutral: the
/// target may be perfectly healthy. Both stay retryable.
fn circuit_outcome(err: &DbError, deadline: Option<Instant>) -> Outcome {
    match err.kind() {
        ErrorKind::PoolTimeout => Outcome::Abandoned,
        ErrorKind::Timeout if deadline.is_some_and(|d| Instant::now() >= d) => Outcome::Abandoned,
        _ => Outcome::Failure(err.classify()),
    }
}

#[derive(Debug, Clone)]
pub struct ResilienceEngine {
    policy: RetryPolicy,
    circuits: Arc<CircuitRegistry>,
    operation_timeout: Option<Duration>,
}

impl ResilienceEngine {
    pub fn new(
        policy: RetryPolicy,
        circuits: Arc<CircuitRegistry>,
        operation_timeout: Option<Duration>,
    ) -> Self {
        Self {
            policy,
            circuits,
            operation_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout
    }

    /// Run `op` against `target` with circuit admission and retries.
    ///
    /// `op` receives the 1-based attempt number. Each attempt is bounded by the
    /// operation timeout and the caller's deadline. Errors always come back
    /// wrapped with the target, operation kind and attempts made.
    pub async fn run<T, F, Fut>(
        &self,
        target: &str,
        kind: OperationKind,
        deadline: Option<Instant>,
        mut op: F,
    ) -> DbResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let breaker = self.circuits.breaker(target);
        let mut attempts = 0u32;

        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(DbError::timeout(kind.as_str(), 0).with_context(target, kind, attempts));
            }

            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(e) => {
                    debug!(target_id = %target, operation = %kind, attempts, "Circuit rejected operation");
                    return Err(e.with_context(target, kind, attempts));
                }
            };

            attempts += 1;
            let attempt_deadline =
                effective_deadline(Instant::now(), self.operation_timeout, deadline);
            let result = with_deadline(kind.as_str(), attempt_deadline, op(attempts)).await;

            let err = match result {
                Ok(value) => {
                    permit.success();
                    return Ok(value);
                }
                Err(e) => e,
            };
            match circuit_outcome(&err, deadline) {
                Outcome::Failure(class) => permit.failure(class),
                _ => permit.abandon(),
            }

            if !self.policy.should_retry(&err, attempts) {
                if attempts > 1 {
                    warn!(
                        target_id = %target,
                        operation = %kind,
                        attempts,
                        error = %err,
                        "Operation failed after retries"
                    );
                }
                return Err(err.with_context(target, kind, attempts));
            }

            let delay = self.policy.backoff(attempts - 1);
            if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                debug!(target_id = %target, operation = %kind, attempts, "Deadline leaves no room for retry");
                return Err(err.with_context(target, kind, attempts));
            }

            warn!(
                target_id = %target,
                operation = %kind,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::resilience::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine(max_attempts: u32, failure_threshold: u32) -> ResilienceEngine {
        ResilienceEngine::new(
            RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                jitter_factor: 0.0,
                ..RetryPolicy::default()
            },
            Arc::new(CircuitRegistry::new(CircuitBreakerConfig {
                failure_threshold,
                ..CircuitBreakerConfig::default()
            })),
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retried_until_success() {
        let engine = engine(3, 10);
        let calls = AtomicU32::new(0);
        let value = engine
            .run("db", OperationKind::Read, None, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(DbError::connection("reset"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_not_retried() {
        let engine = engine(5, 10);
        let err = engine
            .run("db", OperationKind::Write, None, |_| async {
                Err::<(), _>(DbError::query("syntax error", None))
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), Some(1));
        assert_eq!(err.operation(), Some(OperationKind::Write));
        assert_eq!(err.kind(), ErrorKind::QueryExecution);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_maps_to_timeout_kind() {
        let engine = ResilienceEngine::new(
            RetryPolicy::no_retry(),
            Arc::new(CircuitRegistry::default()),
            Some(Duration::from_millis(50)),
        );
        let err = engine
            .run("db", OperationKind::Read, None, |_| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.attempts(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_open_fails_fast_with_context() {
        let engine = engine(1, 1);
        let _ = engine
            .run("db", OperationKind::Read, None, |_| async {
                Err::<(), _>(DbError::connection("reset"))
            })
            .await;

        let calls = AtomicU32::new(0);
        let err = engine
            .run("db", OperationKind::Read, None, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(err.attempts(), Some(0));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_retries() {
        let engine = engine(10, 100);
        let deadline = Instant::now() + Duration::from_millis(25);
        let err = engine
            .run("db", OperationKind::Read, Some(deadline), |_| async {
                Err::<(), _>(DbError::connection("reset"))
            })
            .await
            .unwrap_err();
        // 10ms then 20ms backoff: the second delay would cross the deadline
        assert_eq!(err.attempts(), Some(2));
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_timeouts_do_not_open_circuit() {
        let engine = engine(1, 1);
        for _ in 0..3 {
            let err = engine
                .run("db", OperationKind::Read, None, |_| async {
                    Err::<(), _>(DbError::pool_timeout("db", 10))
                })
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PoolTimeout);
            assert!(err.is_retryable());
        }
        assert_eq!(
            engine.circuits().breaker("db").state(),
            crate::resilience::CircuitState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_deadline_is_neutral_but_operation_timeout_counts() {
        let engine = ResilienceEngine::new(
            RetryPolicy::no_retry(),
            Arc::new(CircuitRegistry::new(CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            })),
            Some(Duration::from_millis(50)),
        );
        let slow = |_: u32| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<(), DbError>(())
        };

        let deadline = Instant::now() + Duration::from_millis(10);
        let err = engine
            .run("db", OperationKind::Read, Some(deadline), slow)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let circuit = engine.circuits().breaker("db");
        assert_eq!(circuit.state(), crate::resilience::CircuitState::Closed);

        let err = engine
            .run("db", OperationKind::Read, None, slow)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(circuit.state(), crate::resilience::CircuitState::Open);
    }

    #[test]
    fn test_effective_deadline_picks_earliest() {
        let now = Instant::now();
        let caller = now + Duration::from_secs(1);
        assert_eq!(
            effective_deadline(now, Some(Duration::from_secs(5)), Some(caller)),
            Some(caller)
        );
        assert_eq!(
            effective_deadline(now, Some(Duration::from_millis(10)), None),
            Some(now + Duration::from_millis(10))
        );
        assert_eq!(effective_deadline(now, None, None), None);
    }
}
