//! Batched, non-atomic bulk writes.
//!
//! Records are split into order-preserving chunks, each written as one backend
//! round trip under its own retry budget. Chunks that succeed are never rolled
//! back when a later chunk fails.

use super::pool::Pool;
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::{OperationKind, Record};
use crate::resilience::ResilienceEngine;
use serde::Serialize;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What to do when some chunks fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialFailurePolicy {
    /// Return the per-chunk report; failures are listed, not raised.
    #[default]
    Report,
    /// Raise `BulkWrite` listing the failed chunks.
    Fail,
}

/// A bulk write request.
#[derive(Debug, Clone)]
pub struct BatchJob {
    /// Destination table or collection
    pub destination: String,
    pub records: Vec<Record>,
    pub batch_size: usize,
    /// Send chunks strictly in sequence and stop at the first failure
    pub ordered: bool,
    pub on_failure: PartialFailurePolicy,
}

impl BatchJob {
    pub fn new(destination: impl Into<String>, records: Vec<Record>, batch_size: usize) -> Self {
        Self {
            destination: destination.into(),
            records,
            batch_size,
            ordered: true,
            on_failure: PartialFailurePolicy::Report,
        }
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn on_failure(mut self, policy: PartialFailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChunkStatus {
    Succeeded { written: u64 },
    Failed { error: String, kind: ErrorKind, attempts: u32 },
    /// Never sent because an earlier ordered chunk failed
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkOutcome {
    pub index: usize,
    pub records: usize,
    #[serde(flatten)]
    pub status: ChunkStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkWriteResult {
    /// Records in chunks that were written
    pub succeeded_count: u64,
    pub failed_chunks: Vec<usize>,
    pub skipped_chunks: Vec<usize>,
    pub total_chunks: usize,
    /// One entry per chunk, in chunk order
    pub outcomes: Vec<ChunkOutcome>,
}

impl BulkWriteResult {
    fn from_outcomes(outcomes: Vec<ChunkOutcome>) -> Self {
        let mut result = Self {
            total_chunks: outcomes.len(),
            ..Self::default()
        };
        for outcome in &outcomes {
            match outcome.status {
                ChunkStatus::Succeeded { .. } => result.succeeded_count += outcome.records as u64,
                ChunkStatus::Failed { .. } => result.failed_chunks.push(outcome.index),
                ChunkStatus::Skipped => result.skipped_chunks.push(outcome.index),
            }
        }
        result.outcomes = outcomes;
        result
    }

    pub fn is_complete(&self) -> bool {
        self.failed_chunks.is_empty() && self.skipped_chunks.is_empty()
    }
}

/// Split `len` items into `ceil(len / batch_size)` consecutive ranges.
pub fn partition(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    if batch_size == 0 {
        return Vec::new();
    }
    (0..len)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(len))
        .collect()
}

/// Writes a [`BatchJob`] to one target.
#[derive(Debug, Clone)]
pub struct BulkWriter {
    engine: Arc<ResilienceEngine>,
    pool: Pool,
    max_concurrent: usize,
}

impl BulkWriter {
    pub fn new(engine: Arc<ResilienceEngine>, pool: Pool, max_concurrent: usize) -> Self {
        Self {
            engine,
            pool,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub async fn write(&self, mut job: BatchJob, deadline: Option<Instant>) -> DbResult<BulkWriteResult> {
        let target = self.pool.target().to_string();
        if job.batch_size == 0 {
            return Err(DbError::invalid_input("batch_size must be greater than 0")
                .with_context(&target, OperationKind::Write, 0));
        }

        let ranges = partition(job.records.len(), job.batch_size);
        debug!(
            target_id = %target,
            destination = %job.destination,
            records = job.records.len(),
            chunks = ranges.len(),
            ordered = job.ordered,
            "Bulk write started"
        );

        let outcomes = if job.ordered {
            self.write_ordered(&job, ranges, deadline).await
        } else {
            let records: Arc<[Record]> = std::mem::take(&mut job.records).into();
            self.write_unordered(&job.destination, records, ranges, deadline)
                .await
        };
        let result = BulkWriteResult::from_outcomes(outcomes);

        info!(
            target_id = %target,
            destination = %job.destination,
            succeeded = result.succeeded_count,
            failed = result.failed_chunks.len(),
            skipped = result.skipped_chunks.len(),
            "Bulk write finished"
        );

        if job.on_failure == PartialFailurePolicy::Fail && !result.failed_chunks.is_empty() {
            let sent = (result.total_chunks - result.skipped_chunks.len()) as u32;
            return Err(
                DbError::bulk_write(result.succeeded_count, result.failed_chunks)
                    .with_context(&target, OperationKind::Write, sent),
            );
        }
        Ok(result)
    }

    async fn write_ordered(
        &self,
        job: &BatchJob,
        ranges: Vec<Range<usize>>,
        deadline: Option<Instant>,
    ) -> Vec<ChunkOutcome> {
        let mut outcomes = Vec::with_capacity(ranges.len());
        let mut aborted = false;
        for (index, range) in ranges.into_iter().enumerate() {
            let records = range.len();
            if aborted {
                outcomes.push(ChunkOutcome {
                    index,
                    records,
                    status: ChunkStatus::Skipped,
                });
                continue;
            }
            let status = write_chunk(
                &self.engine,
                &self.pool,
                &job.destination,
                index,
                &job.records[range],
                deadline,
            )
            .await;
            aborted = matches!(status, ChunkStatus::Failed { .. });
            outcomes.push(ChunkOutcome {
                index,
                records,
                status,
            });
        }
        outcomes
    }

    /// Chunks share one record buffer; a task is spawned only once a permit
    /// frees up, so at most `max_concurrent` chunks are in flight.
    async fn write_unordered(
        &self,
        destination: &str,
        records: Arc<[Record]>,
        ranges: Vec<Range<usize>>,
        deadline: Option<Instant>,
    ) -> Vec<ChunkOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let destination: Arc<str> = Arc::from(destination);
        let sizes: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
        let mut tasks = JoinSet::new();

        for (index, range) in ranges.into_iter().enumerate() {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let records = Arc::clone(&records);
            let engine = Arc::clone(&self.engine);
            let pool = self.pool.clone();
            let destination = Arc::clone(&destination);
            tasks.spawn(async move {
                let _permit = permit;
                let status =
                    write_chunk(&engine, &pool, &destination, index, &records[range], deadline)
                        .await;
                (index, status)
            });
        }

        let mut statuses: Vec<Option<ChunkStatus>> = vec![None; sizes.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, status)) => statuses[index] = Some(status),
                Err(e) => warn!(error = %e, "Bulk chunk task failed"),
            }
        }

        statuses
            .into_iter()
            .zip(sizes)
            .enumerate()
            .map(|(index, (status, records))| ChunkOutcome {
                index,
                records,
                status: status.unwrap_or_else(|| {
                    failed_status(&DbError::internal("bulk chunk task did not complete"))
                }),
            })
            .collect()
    }
}

fn failed_status(err: &DbError) -> ChunkStatus {
    ChunkStatus::Failed {
        error: err.to_string(),
        kind: err.kind(),
        attempts: err.attempts().unwrap_or(0),
    }
}

async fn write_chunk(
    engine: &ResilienceEngine,
    pool: &Pool,
    destination: &str,
    index: usize,
    records: &[Record],
    deadline: Option<Instant>,
) -> ChunkStatus {
    let written = engine
        .run(pool.target(), OperationKind::Write, deadline, |_| async move {
            let mut conn = pool.acquire_by(deadline).await?;
            let inserted = conn.connection()?.insert_many(destination, records).await;
            conn.settle(inserted)
        })
        .await;

    match written {
        Ok(written) => ChunkStatus::Succeeded { written },
        Err(e) => {
            warn!(
                target_id = %pool.target(),
                destination,
                chunk = index,
                records = records.len(),
                error = %e,
                "Bulk chunk failed"
            );
            failed_status(&e)
        }
    }
}
