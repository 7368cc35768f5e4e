//! Failure handling shared by every operation: per-target circuit breakers,
//! retry classification with backoff, and the engine composing them.

pub mod circuit;
pub mod engine;
pub mod retry;

pub use circuit::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitRegistry,
    CircuitSnapshot, CircuitState, CircuitStatus, Outcome,
};
pub use engine::{ResilienceEngine, effective_deadline, with_deadline};
pub use retry::RetryPolicy;
