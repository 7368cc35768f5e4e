//! Bounded fan-out of heterogeneous operations.
//!
//! Results come back index-aligned with the requests. A failing request never
//! affects its siblings, and requests still queued when the batch deadline
//! passes are cancelled without touching a backend.

use super::bulk::{BatchJob, BulkWriteResult};
use crate::error::{DbError, DbResult};
use crate::models::{OperationKind, Record, Statement};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// The unit of work carried by an [`OperationRequest`].
#[derive(Debug, Clone)]
pub enum Operation {
    Query(Statement),
    Execute(Statement),
    /// Drains the cursor into memory. `max_records` stops reading early and
    /// closes the cursor once that many records are held.
    Stream {
        statement: Statement,
        chunk_size: usize,
        max_records: Option<usize>,
    },
    Transaction(Vec<Statement>),
    BulkInsert(BatchJob),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Query(_) => OperationKind::Read,
            Self::Execute(_) | Self::BulkInsert(_) => OperationKind::Write,
            Self::Stream { .. } => OperationKind::Stream,
            Self::Transaction(_) => OperationKind::Transaction,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub target: String,
    pub operation: Operation,
    pub deadline: Option<Instant>,
}

impl OperationRequest {
    pub fn new(target: impl Into<String>, operation: Operation) -> Self {
        Self {
            target: target.into(),
            operation,
            deadline: None,
        }
    }

    pub fn query(target: impl Into<String>, stmt: impl Into<Statement>) -> Self {
        Self::new(target, Operation::Query(stmt.into()))
    }

    pub fn execute(target: impl Into<String>, stmt: impl Into<Statement>) -> Self {
        Self::new(target, Operation::Execute(stmt.into()))
    }

    pub fn stream(target: impl Into<String>, stmt: impl Into<Statement>, chunk_size: usize) -> Self {
        Self::new(
            target,
            Operation::Stream {
                statement: stmt.into(),
                chunk_size,
                max_records: None,
            },
        )
    }

    /// A stream request that keeps at most `max_records` records.
    pub fn stream_limited(
        target: impl Into<String>,
        stmt: impl Into<Statement>,
        chunk_size: usize,
        max_records: usize,
    ) -> Self {
        Self::new(
            target,
            Operation::Stream {
                statement: stmt.into(),
                chunk_size,
                max_records: Some(max_records),
            },
        )
    }

    pub fn transaction(target: impl Into<String>, statements: Vec<Statement>) -> Self {
        Self::new(target, Operation::Transaction(statements))
    }

    pub fn bulk_insert(target: impl Into<String>, job: BatchJob) -> Self {
        Self::new(target, Operation::BulkInsert(job))
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum OperationOutput {
    Rows(Vec<Record>),
    Affected(u64),
    Chunks(Vec<Vec<Record>>),
    Committed(Vec<u64>),
    Bulk(BulkWriteResult),
}

/// Runs one request against the component that owns its kind.
#[async_trait]
pub trait OperationExecutor: Send + Sync + 'static {
    async fn run(&self, request: OperationRequest) -> DbResult<OperationOutput>;
}

#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn OperationExecutor>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn OperationExecutor>) -> Self {
        Self { executor }
    }

    /// Run `requests` with at most `max_concurrent` in flight.
    ///
    /// `result[i]` always belongs to `requests[i]`. Requests not started by
    /// `deadline` fail with `Cancelled`. Started ones are left to finish under
    /// their own deadline and the per-operation timeout.
    pub async fn execute_all(
        &self,
        requests: Vec<OperationRequest>,
        max_concurrent: usize,
        deadline: Option<Instant>,
    ) -> Vec<DbResult<OperationOutput>> {
        let total = requests.len();
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut tasks = JoinSet::new();
        let mut index_of = HashMap::with_capacity(total);
        let mut meta = Vec::with_capacity(total);

        for (index, request) in requests.into_iter().enumerate() {
            let target = request.target.clone();
            let kind = request.kind();
            meta.push((target.clone(), kind));

            let executor = Arc::clone(&self.executor);
            let semaphore = Arc::clone(&semaphore);
            let handle = tasks.spawn(async move {
                let acquired = match deadline {
                    Some(d) => tokio::time::timeout_at(d, semaphore.acquire_owned())
                        .await
                        .ok(),
                    None => Some(semaphore.acquire_owned().await),
                };
                let _permit = match acquired {
                    Some(Ok(permit)) if deadline.is_none_or(|d| Instant::now() < d) => permit,
                    Some(Err(_)) => {
                        return Err(DbError::cancelled("dispatcher shut down")
                            .with_context(&target, kind, 0));
                    }
                    _ => {
                        debug!(target_id = %target, operation = %kind, index, "Request cancelled before start");
                        return Err(DbError::cancelled("deadline passed before the request started")
                            .with_context(&target, kind, 0));
                    }
                };
                executor.run(request).await
            });
            index_of.insert(handle.id(), index);
        }

        let mut results: Vec<Option<DbResult<OperationOutput>>> =
            std::iter::repeat_with(|| None).take(total).collect();
        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((id, result)) => (id, result),
                Err(e) => {
                    warn!(error = %e, "Dispatched request task failed");
                    (e.id(), Err(DbError::internal(format!("request task failed: {e}"))))
                }
            };
            if let Some(&index) = index_of.get(&id) {
                results[index] = Some(result);
            }
        }

        results
            .into_iter()
            .zip(meta)
            .map(|(result, (target, kind))| {
                result
                    .unwrap_or_else(|| Err(DbError::internal("request produced no result")))
                    .map_err(|e| match e.target() {
                        Some(_) => e,
                        None => e.with_context(target, kind, 0),
                    })
            })
            .collect()
    }
}
