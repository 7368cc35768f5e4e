//! Per-target circuit breaker.
//!
//! State lives in a [`CircuitSnapshot`] guarded by one mutex per target. Every
//! decision is made by a pure function over `(snapshot, config, now)` inside that
//! critical section, so concurrent callers always observe atomic transitions:
//!
//! ```text
//! Closed --(failures >= failure_threshold)--> Open
//! Open --(cooldown elapsed)--> HalfOpen
//! HalfOpen --(successes >= success_threshold)--> Closed
//! HalfOpen --(any failure)--> Open (cooldown restarts)
//! ```
//!
//! Only transient failures count. Fatal errors (bad credentials, malformed
//! statements) say nothing about the target's health and leave counts untouched.

use crate::error::{DbError, FailureClass};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Operations flow through normally
    Closed,
    /// Operations fail fast until the cooldown elapses
    Open,
    /// A limited number of trial operations probe the target
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive Closed-state failures before opening
    pub failure_threshold: u32,
    /// Half-open successes before closing
    pub success_threshold: u32,
    /// Time an open circuit waits before admitting trial operations
    pub cooldown: Duration,
    /// Concurrent trial operations admitted while half-open
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(30),
            half_open_max_probes: 1,
        }
    }
}

/// Explicit state of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<Instant>,
    pub probes_in_flight: u32,
}

impl CircuitSnapshot {
    pub fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            probes_in_flight: 0,
        }
    }

    fn open(now: Instant) -> Self {
        Self {
            state: CircuitState::Open,
            opened_at: Some(now),
            ..Self::closed()
        }
    }
}

/// Outcome of asking the circuit to admit an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed. `probe` is set for half-open trial operations.
    Allowed { probe: bool },
    /// Fail fast; the circuit may admit again after `retry_after`.
    Rejected { retry_after: Duration },
}

/// Outcome of an admitted operation, as seen by the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(FailureClass),
    /// The operation was abandoned before finishing (cancelled caller).
    Abandoned,
}

/// Decide whether an operation may proceed.
pub fn admit(
    snapshot: CircuitSnapshot,
    config: &CircuitBreakerConfig,
    now: Instant,
) -> (CircuitSnapshot, Admission) {
    let mut next = snapshot;
    if next.state == CircuitState::Open {
        let opened_at = next.opened_at.unwrap_or(now);
        let elapsed = now.saturating_duration_since(opened_at);
        if elapsed < config.cooldown {
            return (
                next,
                Admission::Rejected {
                    retry_after: config.cooldown - elapsed,
                },
            );
        }
        next = CircuitSnapshot {
            state: CircuitState::HalfOpen,
            opened_at: Some(opened_at),
            ..CircuitSnapshot::closed()
        };
    }

    match next.state {
        CircuitState::HalfOpen if next.probes_in_flight >= config.half_open_max_probes => {
            (next, Admission::Rejected { retry_after: Duration::ZERO })
        }
        CircuitState::HalfOpen => {
            next.probes_in_flight += 1;
            (next, Admission::Allowed { probe: true })
        }
        _ => (next, Admission::Allowed { probe: false }),
    }
}

/// Fold an operation's outcome into the circuit state.
pub fn record(
    snapshot: CircuitSnapshot,
    config: &CircuitBreakerConfig,
    outcome: Outcome,
    probe: bool,
    now: Instant,
) -> CircuitSnapshot {
    let mut next = snapshot;
    if probe {
        next.probes_in_flight = next.probes_in_flight.saturating_sub(1);
    }

    match (next.state, outcome) {
        (_, Outcome::Abandoned) | (_, Outcome::Failure(FailureClass::Fatal)) => next,
        // Outcomes of operations admitted before the circuit opened
        (CircuitState::Open, _) => next,
        (CircuitState::Closed, Outcome::Success) => {
            next.failure_count = 0;
            next
        }
        (CircuitState::Closed, Outcome::Failure(FailureClass::Transient)) => {
            next.failure_count += 1;
            if next.failure_count >= config.failure_threshold {
                CircuitSnapshot::open(now)
            } else {
                next
            }
        }
        // Only trial operations speak for a half-open target
        (CircuitState::HalfOpen, _) if !probe => next,
        (CircuitState::HalfOpen, Outcome::Success) => {
            next.success_count += 1;
            if next.success_count >= config.success_threshold {
                CircuitSnapshot::closed()
            } else {
                next
            }
        }
        (CircuitState::HalfOpen, Outcome::Failure(FailureClass::Transient)) => {
            CircuitSnapshot::open(now)
        }
    }
}

/// Serializable view of a circuit for stats and health reports.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub target: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Remaining cooldown while open
    pub retry_after_ms: Option<u64>,
}

/// The circuit breaker for one target.
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitSnapshot>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            state: Mutex::new(CircuitSnapshot::closed()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitSnapshot> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        *self.lock()
    }

    /// Current state, with any due Open -> HalfOpen transition not yet applied.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn status(&self) -> CircuitStatus {
        let snapshot = self.snapshot();
        let retry_after_ms = match (snapshot.state, snapshot.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                self.config
                    .cooldown
                    .saturating_sub(opened_at.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };
        CircuitStatus {
            target: self.target.clone(),
            state: snapshot.state,
            failure_count: snapshot.failure_count,
            success_count: snapshot.success_count,
            retry_after_ms,
        }
    }

    /// Ask to run one operation. Fails fast with `CircuitOpen` when rejected.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CircuitPermit, DbError> {
        let now = Instant::now();
        let admission = {
            let mut state = self.lock();
            let before = state.state;
            let (next, admission) = admit(*state, &self.config, now);
            *state = next;
            self.log_transition(before, next);
            admission
        };
        match admission {
            Admission::Allowed { probe } => Ok(CircuitPermit {
                breaker: Arc::clone(self),
                probe,
                settled: false,
            }),
            Admission::Rejected { retry_after } => Err(DbError::circuit_open(
                &self.target,
                retry_after.as_millis() as u64,
            )),
        }
    }

    fn settle(&self, outcome: Outcome, probe: bool) {
        let now = Instant::now();
        let mut state = self.lock();
        let before = state.state;
        let next = record(*state, &self.config, outcome, probe, now);
        *state = next;
        self.log_transition(before, next);
    }

    fn log_transition(&self, before: CircuitState, after: CircuitSnapshot) {
        if before == after.state {
            return;
        }
        match after.state {
            CircuitState::Open => warn!(
                target_id = %self.target,
                from = %before,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "Circuit opened"
            ),
            CircuitState::HalfOpen => info!(target_id = %self.target, "Circuit half-open, probing target"),
            CircuitState::Closed => info!(target_id = %self.target, "Circuit closed after successful recovery"),
        }
    }

    /// Force the circuit closed, dropping all counts.
    pub fn reset(&self) {
        let mut state = self.lock();
        let before = state.state;
        *state = CircuitSnapshot::closed();
        self.log_transition(before, *state);
    }
}

/// Admission to run one operation. Report the outcome with
/// [`success`](Self::success) or [`failure`](Self::failure); dropping an
/// unsettled permit frees its half-open trial slot without counting.
#[derive(Debug)]
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl CircuitPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(Outcome::Success, self.probe);
    }

    pub fn failure(mut self, class: FailureClass) {
        self.settled = true;
        self.breaker.settle(Outcome::Failure(class), self.probe);
    }

    /// Settle without counting toward either threshold.
    pub fn abandon(mut self) {
        self.settled = true;
        self.breaker.settle(Outcome::Abandoned, self.probe);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(Outcome::Abandoned, self.probe);
        }
    }
}

/// Injected registry of per-target circuits.
///
/// Circuits persist for the registry's lifetime, even across disconnects of
/// the target they guard.
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// The circuit for `target`, created closed on first use.
    pub fn breaker(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(target) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.breakers
                .entry(target.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(target, self.config.clone())))
                .value(),
        )
    }

    pub fn get(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(target).map(|b| Arc::clone(b.value()))
    }

    pub fn statuses(&self) -> Vec<CircuitStatus> {
        let mut statuses: Vec<_> = self.breakers.iter().map(|b| b.value().status()).collect();
        statuses.sort_by(|a, b| a.target.cmp(&b.target));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            cooldown: Duration::from_secs(10),
            half_open_max_probes: 1,
        }
    }

    const TRANSIENT: Outcome = Outcome::Failure(FailureClass::Transient);

    #[test]
    fn test_opens_exactly_at_threshold() {
        let cfg = config();
        let now = Instant::now();
        let mut s = CircuitSnapshot::closed();
        for _ in 0..2 {
            s = record(s, &cfg, TRANSIENT, false, now);
            assert_eq!(s.state, CircuitState::Closed);
        }
        s = record(s, &cfg, TRANSIENT, false, now);
        assert_eq!(s.state, CircuitState::Open);
        assert_eq!(s.opened_at, Some(now));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cfg = config();
        let now = Instant::now();
        let mut s = CircuitSnapshot::closed();
        s = record(s, &cfg, TRANSIENT, false, now);
        s = record(s, &cfg, TRANSIENT, false, now);
        s = record(s, &cfg, Outcome::Success, false, now);
        s = record(s, &cfg, TRANSIENT, false, now);
        assert_eq!(s.state, CircuitState::Closed);
        assert_eq!(s.failure_count, 1);
    }

    #[test]
    fn test_fatal_failures_are_not_counted() {
        let cfg = config();
        let now = Instant::now();
        let mut s = CircuitSnapshot::closed();
        for _ in 0..10 {
            s = record(s, &cfg, Outcome::Failure(FailureClass::Fatal), false, now);
        }
        assert_eq!(s.state, CircuitState::Closed);
        assert_eq!(s.failure_count, 0);
    }

    #[test]
    fn test_open_rejects_until_cooldown() {
        let cfg = config();
        let now = Instant::now();
        let s = CircuitSnapshot::open(now);

        let (s, admission) = admit(s, &cfg, now + Duration::from_secs(4));
        assert_eq!(
            admission,
            Admission::Rejected {
                retry_after: Duration::from_secs(6)
            }
        );

        let (s, admission) = admit(s, &cfg, now + Duration::from_secs(10));
        assert_eq!(admission, Admission::Allowed { probe: true });
        assert_eq!(s.state, CircuitState::HalfOpen);
        assert_eq!(s.probes_in_flight, 1);
    }

    #[test]
    fn test_half_open_limits_probes() {
        let cfg = config();
        let now = Instant::now();
        let (s, _) = admit(CircuitSnapshot::open(now), &cfg, now + cfg.cooldown);
        let (_, second) = admit(s, &cfg, now + cfg.cooldown);
        assert!(matches!(second, Admission::Rejected { .. }));
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let cfg = config();
        let t0 = Instant::now();
        let t1 = t0 + cfg.cooldown;
        let (s, _) = admit(CircuitSnapshot::open(t0), &cfg, t1);
        let s = record(s, &cfg, Outcome::Success, true, t1);
        assert_eq!(s.state, CircuitState::HalfOpen);
        let (s, _) = admit(s, &cfg, t1);
        let s = record(s, &cfg, Outcome::Success, true, t1);
        assert_eq!(s, CircuitSnapshot::closed());
    }

    #[test]
    fn test_half_open_reopens_on_first_failure() {
        let cfg = CircuitBreakerConfig {
            success_threshold: 5,
            ..config()
        };
        let t0 = Instant::now();
        let t1 = t0 + cfg.cooldown;
        let (mut s, _) = admit(CircuitSnapshot::open(t0), &cfg, t1);
        s = record(s, &cfg, Outcome::Success, true, t1);
        let (next, _) = admit(s, &cfg, t1);
        s = record(next, &cfg, Outcome::Success, true, t1);
        assert_eq!(s.success_count, 2);

        let t2 = t1 + Duration::from_secs(1);
        let (next, _) = admit(s, &cfg, t2);
        s = record(next, &cfg, TRANSIENT, true, t2);
        assert_eq!(s.state, CircuitState::Open);
        // Cooldown restarts from the reopening
        assert_eq!(s.opened_at, Some(t2));
        assert_eq!(s.success_count, 0);
    }

    #[test]
    fn test_abandoned_probe_frees_slot() {
        let cfg = config();
        let t0 = Instant::now();
        let (s, _) = admit(CircuitSnapshot::open(t0), &cfg, t0 + cfg.cooldown);
        let s = record(s, &cfg, Outcome::Abandoned, true, t0 + cfg.cooldown);
        assert_eq!(s.state, CircuitState::HalfOpen);
        assert_eq!(s.probes_in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_permits_and_fail_fast() {
        let breaker = Arc::new(CircuitBreaker::new(
            "orders",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..config()
            },
        ));
        breaker
            .try_acquire()
            .unwrap()
            .failure(FailureClass::Transient);
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.try_acquire().unwrap_err();
        assert!(matches!(err, DbError::CircuitOpen { .. }));

        tokio::time::advance(Duration::from_secs(10)).await;
        let permit = breaker.try_acquire().unwrap();
        assert!(permit.is_probe());
        drop(permit);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_registry_returns_same_breaker() {
        let registry = CircuitRegistry::new(config());
        let a = registry.breaker("orders");
        let b = registry.breaker("orders");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.statuses().len(), 1);
    }
}
