//! Connection manager: one pool per target behind a shared resilience engine.
//!
//! This is the capability-set facade handed to collaborators: pooled access,
//! queries, streaming, bulk writes, transactions, concurrent fan-out and
//! health/statistics reporting.

use super::bulk::{BatchJob, BulkWriteResult, BulkWriter};
use super::dispatcher::{Dispatcher, Operation, OperationExecutor, OperationOutput, OperationRequest};
use super::pool::{Pool, PoolConfig, PoolStats, PooledConnection};
use super::stream::StreamCursor;
use super::transaction::{TransactionCoordinator, TransactionScope};
use crate::backend::{ConnectionFactory, factory_for};
use crate::config::{DEFAULT_BATCH_SIZE, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT};
use crate::error::{DbError, DbResult};
use crate::models::{BackendKind, ConnectionConfig, OperationKind, Record, Statement};
use crate::resilience::{
    CircuitBreakerConfig, CircuitRegistry, CircuitStatus, ResilienceEngine, RetryPolicy,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Settings shared by every target of a manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    /// Bound on each attempt of an operation
    pub operation_timeout: Option<Duration>,
    /// Concurrency cap for fan-out and unordered bulk writes
    pub max_concurrent: usize,
    /// Default stream chunk size
    pub chunk_size: usize,
    /// Default bulk write batch size
    pub batch_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            operation_timeout: Some(Duration::from_secs(30)),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Result of pinging one target.
#[derive(Debug, Clone, Serialize)]
pub struct TargetHealth {
    pub target: String,
    pub backend: BackendKind,
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub circuit: CircuitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetStats {
    pub backend: BackendKind,
    pub pool: PoolStats,
    pub circuit: CircuitStatus,
}

#[derive(Debug, Clone)]
struct TargetEntry {
    pool: Pool,
    backend: BackendKind,
}

struct Inner {
    config: ManagerConfig,
    engine: Arc<ResilienceEngine>,
    targets: RwLock<HashMap<String, TargetEntry>>,
}

/// Cloning is cheap; all clones share the same targets and circuits.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig) -> Self {
        let registry = Arc::new(CircuitRegistry::new(config.breaker.clone()));
        Self::with_registry(config, registry)
    }

    /// Create a manager whose circuits live in `registry`.
    pub fn with_registry(config: ManagerConfig, registry: Arc<CircuitRegistry>) -> Self {
        let engine = Arc::new(ResilienceEngine::new(
            config.retry.clone(),
            registry,
            config.operation_timeout,
        ));
        Self {
            inner: Arc::new(Inner {
                config,
                engine,
                targets: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &Arc<ResilienceEngine> {
        &self.inner.engine
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        self.inner.engine.circuits()
    }

    /// Register a target from its validated configuration.
    pub async fn connect(&self, config: ConnectionConfig) -> DbResult<()> {
        info!(
            target_id = %config.id,
            backend = %config.backend,
            url = %config.masked_connection_string(),
            "Connecting to target"
        );
        let factory = factory_for(&config)?;
        let pool_config = config
            .pool_options
            .to_pool_config(config.backend == BackendKind::SQLite);
        self.connect_with_factory(&config.id, factory, pool_config)
            .await
    }

    /// Register a target served by `factory`.
    pub async fn connect_with_factory(
        &self,
        id: &str,
        factory: Arc<dyn ConnectionFactory>,
        pool_config: PoolConfig,
    ) -> DbResult<()> {
        if self.inner.targets.read().await.contains_key(id) {
            return Err(DbError::invalid_input(format!(
                "target '{id}' is already connected"
            )));
        }

        let backend = factory.kind();
        let pool = Pool::connect(id, pool_config, factory).await?;

        // Re-check after the async work; a concurrent connect may have won
        let duplicate = {
            let mut targets = self.inner.targets.write().await;
            if targets.contains_key(id) {
                Some(pool)
            } else {
                targets.insert(id.to_string(), TargetEntry { pool, backend });
                None
            }
        };
        if let Some(pool) = duplicate {
            pool.close().await;
            return Err(DbError::invalid_input(format!(
                "target '{id}' is already connected"
            )));
        }

        info!(target_id = %id, backend = %backend, "Target connected");
        Ok(())
    }

    /// Close a target's pool and forget it. Its circuit is kept.
    pub async fn disconnect(&self, id: &str) -> DbResult<()> {
        let entry = self.inner.targets.write().await.remove(id);
        match entry {
            Some(entry) => {
                entry.pool.close().await;
                info!(target_id = %id, "Target disconnected");
                Ok(())
            }
            None => Err(DbError::target_not_found(id)),
        }
    }

    pub async fn targets(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.targets.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn entry(&self, target: &str, kind: OperationKind) -> DbResult<TargetEntry> {
        self.inner
            .targets
            .read()
            .await
            .get(target)
            .cloned()
            .ok_or_else(|| DbError::target_not_found(target).with_context(target, kind, 0))
    }

    /// The pool serving `target`.
    pub async fn pool(&self, target: &str) -> DbResult<Pool> {
        Ok(self.entry(target, OperationKind::Read).await?.pool)
    }

    /// Check out a connection from `target`'s pool.
    pub async fn acquire(&self, target: &str, deadline: Option<Instant>) -> DbResult<PooledConnection> {
        let pool = self.entry(target, OperationKind::Read).await?.pool;
        let pool = &pool;
        self.inner
            .engine
            .run(target, OperationKind::Read, deadline, |_| async move {
                pool.acquire_by(deadline).await
            })
            .await
    }

    /// Return a checked-out connection with an explicit health verdict.
    pub fn release(&self, conn: PooledConnection, healthy: bool) {
        conn.release(healthy);
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute_query(
        &self,
        target: &str,
        stmt: impl Into<Statement>,
        deadline: Option<Instant>,
    ) -> DbResult<u64> {
        let stmt = stmt.into();
        let pool = self.entry(target, OperationKind::Write).await?.pool;
        let (pool, stmt) = (&pool, &stmt);
        self.inner
            .engine
            .run(target, OperationKind::Write, deadline, |_| async move {
                let mut conn = pool.acquire_by(deadline).await?;
                let executed = conn.connection()?.execute(stmt).await;
                conn.settle(executed)
            })
            .await
    }

    /// Run `stmts` in order, each with its own retry budget. Stops at the
    /// first failure; earlier statements stay applied.
    pub async fn execute_many(
        &self,
        target: &str,
        stmts: Vec<Statement>,
        deadline: Option<Instant>,
    ) -> DbResult<Vec<u64>> {
        let mut affected = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            affected.push(self.execute_query(target, stmt, deadline).await?);
        }
        Ok(affected)
    }

    pub async fn fetch_all(
        &self,
        target: &str,
        stmt: impl Into<Statement>,
        deadline: Option<Instant>,
    ) -> DbResult<Vec<Record>> {
        let stmt = stmt.into();
        let pool = self.entry(target, OperationKind::Read).await?.pool;
        let (pool, stmt) = (&pool, &stmt);
        self.inner
            .engine
            .run(target, OperationKind::Read, deadline, |_| async move {
                let mut conn = pool.acquire_by(deadline).await?;
                let fetched = conn.connection()?.query(stmt).await;
                conn.settle(fetched)
            })
            .await
    }

    /// First record of the result, if any.
    pub async fn fetch_one(
        &self,
        target: &str,
        stmt: impl Into<Statement>,
        deadline: Option<Instant>,
    ) -> DbResult<Option<Record>> {
        Ok(self.fetch_all(target, stmt, deadline).await?.into_iter().next())
    }

    /// Open a chunked cursor. `chunk_size` falls back to the manager default.
    pub async fn stream_query(
        &self,
        target: &str,
        stmt: impl Into<Statement>,
        chunk_size: Option<usize>,
        deadline: Option<Instant>,
    ) -> DbResult<StreamCursor> {
        let stmt = stmt.into();
        let pool = self.entry(target, OperationKind::Stream).await?.pool;
        let chunk_size = chunk_size.unwrap_or(self.inner.config.chunk_size);
        StreamCursor::open(&self.inner.engine, &pool, &stmt, chunk_size, deadline).await
    }

    pub async fn bulk_insert(
        &self,
        target: &str,
        job: BatchJob,
        deadline: Option<Instant>,
    ) -> DbResult<BulkWriteResult> {
        let pool = self.entry(target, OperationKind::Write).await?.pool;
        BulkWriter::new(
            Arc::clone(&self.inner.engine),
            pool,
            self.inner.config.max_concurrent,
        )
        .write(job, deadline)
        .await
    }

    /// Bulk insert with the manager's default batch size.
    pub async fn insert_batched(
        &self,
        target: &str,
        destination: &str,
        records: Vec<Record>,
        ordered: bool,
    ) -> DbResult<BulkWriteResult> {
        let job = BatchJob::new(destination, records, self.inner.config.batch_size).ordered(ordered);
        self.bulk_insert(target, job, None).await
    }

    /// Begin a transaction on `target`.
    pub async fn transaction(
        &self,
        target: &str,
        deadline: Option<Instant>,
    ) -> DbResult<TransactionScope> {
        self.coordinator(target).await?.begin(deadline).await
    }

    pub async fn execute_transaction(
        &self,
        target: &str,
        stmts: Vec<Statement>,
        deadline: Option<Instant>,
    ) -> DbResult<Vec<u64>> {
        self.coordinator(target)
            .await?
            .execute_transaction(stmts, deadline)
            .await
    }

    async fn coordinator(&self, target: &str) -> DbResult<TransactionCoordinator> {
        let pool = self.entry(target, OperationKind::Transaction).await?.pool;
        Ok(TransactionCoordinator::new(
            Arc::clone(&self.inner.engine),
            pool,
        ))
    }

    /// Run `requests` under the configured concurrency cap.
    pub async fn execute_concurrent(
        &self,
        requests: Vec<OperationRequest>,
        deadline: Option<Instant>,
    ) -> Vec<DbResult<OperationOutput>> {
        self.execute_concurrent_with(requests, self.inner.config.max_concurrent, deadline)
            .await
    }

    pub async fn execute_concurrent_with(
        &self,
        requests: Vec<OperationRequest>,
        max_concurrent: usize,
        deadline: Option<Instant>,
    ) -> Vec<DbResult<OperationOutput>> {
        debug!(requests = requests.len(), max_concurrent, "Dispatching requests");
        Dispatcher::new(Arc::new(self.clone()))
            .execute_all(requests, max_concurrent, deadline)
            .await
    }

    /// Ping one pooled connection of `target`, returning the round-trip time.
    pub async fn test_connection(&self, target: &str) -> DbResult<Duration> {
        let pool = self.entry(target, OperationKind::Read).await?.pool;
        let pool = &pool;
        self.inner
            .engine
            .run(target, OperationKind::Read, None, |_| async move {
                let mut conn = pool.get().await?;
                let started = Instant::now();
                let pinged = conn.connection()?.ping().await;
                conn.settle(pinged)?;
                Ok(started.elapsed())
            })
            .await
    }

    /// Ping every target concurrently.
    pub async fn health_check(&self) -> Vec<TargetHealth> {
        let entries: Vec<(String, TargetEntry)> = {
            let targets = self.inner.targets.read().await;
            let mut entries: Vec<_> = targets
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        };

        let checks = entries.into_iter().map(|(id, entry)| async move {
            let result = self.test_connection(&id).await;
            let circuit = self.circuits().breaker(&id).status();
            if let Err(e) = &result {
                warn!(target_id = %id, error = %e, "Health check failed");
            }
            TargetHealth {
                backend: entry.backend,
                healthy: result.is_ok(),
                latency_ms: result.as_ref().ok().map(|d| d.as_millis() as u64),
                error: result.err().map(|e| e.to_string()),
                circuit,
                target: id,
                checked_at: Utc::now(),
            }
        });
        futures_util::future::join_all(checks).await
    }

    /// Pool and circuit statistics per target.
    pub async fn stats(&self) -> Vec<TargetStats> {
        let targets = self.inner.targets.read().await;
        let mut stats: Vec<TargetStats> = targets
            .iter()
            .map(|(id, entry)| TargetStats {
                backend: entry.backend,
                pool: entry.pool.stats(),
                circuit: self.circuits().breaker(id).status(),
            })
            .collect();
        stats.sort_by(|a, b| a.pool.target.cmp(&b.pool.target));
        stats
    }

    /// Close every pool.
    pub async fn close(&self) {
        let entries: Vec<(String, TargetEntry)> =
            self.inner.targets.write().await.drain().collect();
        for (id, entry) in entries {
            info!(target_id = %id, "Closing target");
            entry.pool.close().await;
        }
        info!("All targets closed");
    }
}

#[async_trait]
impl OperationExecutor for ConnectionManager {
    async fn run(&self, request: OperationRequest) -> DbResult<OperationOutput> {
        let OperationRequest {
            target,
            operation,
            deadline,
        } = request;
        match operation {
            Operation::Query(stmt) => self
                .fetch_all(&target, stmt, deadline)
                .await
                .map(OperationOutput::Rows),
            Operation::Execute(stmt) => self
                .execute_query(&target, stmt, deadline)
                .await
                .map(OperationOutput::Affected),
            Operation::Stream {
                statement,
                chunk_size,
                max_records,
            } => {
                let mut cursor = self
                    .stream_query(&target, statement, Some(chunk_size), deadline)
                    .await?;
                let mut remaining = max_records.unwrap_or(usize::MAX);
                let mut chunks = Vec::new();
                while remaining > 0 {
                    let Some(chunk) = cursor.next_chunk(chunk_size.min(remaining)).await? else {
                        return Ok(OperationOutput::Chunks(chunks));
                    };
                    remaining -= chunk.len();
                    chunks.push(chunk);
                }
                cursor.close().await?;
                Ok(OperationOutput::Chunks(chunks))
            }
            Operation::Transaction(stmts) => self
                .execute_transaction(&target, stmts, deadline)
                .await
                .map(OperationOutput::Committed),
            Operation::BulkInsert(job) => self
                .bulk_insert(&target, job, deadline)
                .await
                .map(OperationOutput::Bulk),
        }
    }
}
