//! Data access core.
//!
//! This module provides:
//! - Per-target connection pools with FIFO waiters and background maintenance
//! - Chunked streaming cursors
//! - Batched bulk writes
//! - Transactions scoped to one connection
//! - Bounded concurrent dispatch of mixed operations
//! - The connection manager tying them together

pub mod bulk;
pub mod dispatcher;
pub mod manager;
pub mod pool;
pub mod stream;
pub mod transaction;

pub use bulk::{
    BatchJob, BulkWriteResult, BulkWriter, ChunkOutcome, ChunkStatus, PartialFailurePolicy,
};
pub use dispatcher::{
    Dispatcher, Operation, OperationExecutor, OperationOutput, OperationRequest,
};
pub use manager::{ConnectionManager, ManagerConfig, TargetHealth, TargetStats};
pub use pool::{MaintenanceReport, Pool, PoolConfig, PoolStats, PooledConnection};
pub use stream::StreamCursor;
pub use transaction::{TransactionCoordinator, TransactionScope, TransactionState};
