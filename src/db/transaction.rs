//! Transactions scoped to one exclusively held connection.
//!
//! Beginning a transaction goes through the resilience engine. Statements
//! inside it never do: a failed statement may have had side effects, so any
//! failure rolls the whole transaction back and surfaces as
//! `TransactionAborted`.

use super::pool::{Pool, PooledConnection};
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::{OperationKind, Record, Statement};
use crate::resilience::{ResilienceEngine, effective_deadline, with_deadline};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Run one backend call on a pooled connection under a deadline and settle it.
macro_rules! on_connection {
    ($conn:expr, $deadline:expr, $label:expr, |$c:ident| $call:expr) => {{
        let conn: &mut PooledConnection = $conn;
        let result = match conn.connection() {
            Ok($c) => with_deadline($label, $deadline, $call).await,
            Err(e) => Err(e),
        };
        conn.settle(result)
    }};
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// An open transaction. All statements run on the same connection.
pub struct TransactionScope {
    id: String,
    target: String,
    conn: Option<PooledConnection>,
    state: TransactionState,
    log: Vec<Statement>,
    deadline: Option<Instant>,
    statement_timeout: Option<Duration>,
    started_at: Instant,
}

impl std::fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &self.state)
            .field("statements", &self.log.len())
            .finish()
    }
}

impl TransactionScope {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Statements executed successfully so far, in order.
    pub fn statements(&self) -> &[Statement] {
        &self.log
    }

    fn call_deadline(&self) -> Option<Instant> {
        effective_deadline(Instant::now(), self.statement_timeout, self.deadline)
    }

    fn context(&self, err: DbError) -> DbError {
        err.with_context(&self.target, OperationKind::Transaction, 1)
    }

    fn ensure_active(&self) -> DbResult<()> {
        if self.state != TransactionState::Active {
            return Err(self.context(DbError::invalid_input(format!(
                "transaction {} is no longer active ({:?})",
                self.id, self.state
            ))));
        }
        Ok(())
    }

    fn active_conn(&mut self) -> DbResult<&mut PooledConnection> {
        self.ensure_active()?;
        match self.conn.as_mut() {
            Some(conn) => Ok(conn),
            None => Err(DbError::internal("active transaction has no connection")),
        }
    }

    /// Execute a statement inside the transaction.
    pub async fn execute(&mut self, stmt: Statement) -> DbResult<u64> {
        let deadline = self.call_deadline();
        let conn = self.active_conn()?;
        let result = on_connection!(conn, deadline, "transaction statement", |c| c.execute(&stmt));
        match result {
            Ok(affected) => {
                self.log.push(stmt);
                Ok(affected)
            }
            Err(e) => Err(self.abort(e).await),
        }
    }

    /// Run a read inside the transaction.
    pub async fn query(&mut self, stmt: Statement) -> DbResult<Vec<Record>> {
        let deadline = self.call_deadline();
        let conn = self.active_conn()?;
        let result = on_connection!(conn, deadline, "transaction query", |c| c.query(&stmt));
        match result {
            Ok(records) => {
                self.log.push(stmt);
                Ok(records)
            }
            Err(e) => Err(self.abort(e).await),
        }
    }

    /// Create a named savepoint.
    ///
    /// Fails with `Capability` on backends without savepoints; that failure
    /// leaves the transaction active.
    pub async fn savepoint(&mut self, name: &str) -> DbResult<()> {
        self.ensure_active()?;
        self.check_savepoints()?;
        let deadline = self.call_deadline();
        let conn = self.active_conn()?;
        let result = on_connection!(conn, deadline, "savepoint", |c| c.savepoint(name));
        self.settle_step(result).await
    }

    /// Roll back to a savepoint created earlier in this transaction.
    pub async fn rollback_to(&mut self, name: &str) -> DbResult<()> {
        self.ensure_active()?;
        self.check_savepoints()?;
        let deadline = self.call_deadline();
        let conn = self.active_conn()?;
        let result = on_connection!(conn, deadline, "rollback to savepoint", |c| c
            .rollback_to_savepoint(name));
        self.settle_step(result).await
    }

    fn check_savepoints(&self) -> DbResult<()> {
        let Some(conn) = self.conn.as_ref() else {
            return Ok(());
        };
        if conn.capabilities().savepoints {
            Ok(())
        } else {
            Err(self.context(DbError::capability(conn.backend_name(), "savepoints")))
        }
    }

    /// Request errors leave the transaction usable; anything else aborts it.
    async fn settle_step(&mut self, result: DbResult<()>) -> DbResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::Capability | ErrorKind::InvalidInput) => {
                Err(self.context(e))
            }
            Err(e) => Err(self.abort(e).await),
        }
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        let deadline = self.call_deadline();
        let conn = self.active_conn()?;
        let result = on_connection!(conn, deadline, "commit", |c| c.commit());
        match result {
            Ok(()) => {
                if let Some(conn) = self.conn.take() {
                    conn.release(true);
                }
                self.state = TransactionState::Committed;
                info!(
                    target_id = %self.target,
                    transaction_id = %self.id,
                    statements = self.log.len(),
                    elapsed_ms = self.started_at.elapsed().as_millis() as u64,
                    "Transaction committed"
                );
                Ok(())
            }
            Err(e) => Err(self.abort(e).await),
        }
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        self.ensure_active()?;
        let result = self.roll_back_and_release().await;
        self.state = TransactionState::RolledBack;
        info!(target_id = %self.target, transaction_id = %self.id, "Transaction rolled back");
        result.map_err(|e| self.context(e))
    }

    async fn abort(&mut self, cause: DbError) -> DbError {
        warn!(
            target_id = %self.target,
            transaction_id = %self.id,
            statements = self.log.len(),
            error = %cause,
            "Transaction aborted, rolling back"
        );
        if let Err(e) = self.roll_back_and_release().await {
            debug!(transaction_id = %self.id, error = %e, "Rollback after abort failed");
        }
        self.state = TransactionState::RolledBack;
        self.context(DbError::transaction_aborted(&self.id, cause))
    }

    /// Roll back on the scoped connection and hand it back to the pool.
    ///
    /// A connection already known to be broken is discarded without a round
    /// trip; closing the session ends the backend transaction.
    async fn roll_back_and_release(&mut self) -> DbResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        if conn.is_broken() {
            conn.release(false);
            return Ok(());
        }
        let deadline = self.statement_timeout.map(|t| Instant::now() + t);
        let result = on_connection!(&mut conn, deadline, "rollback", |c| c.rollback());
        conn.release(result.is_ok());
        result
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.state != TransactionState::Active {
            return;
        }
        if let Some(mut conn) = self.conn.take() {
            warn!(
                target_id = %self.target,
                transaction_id = %self.id,
                "Transaction dropped while active; discarding its connection"
            );
            conn.mark_broken();
        }
    }
}

/// Opens transactions on one target.
#[derive(Debug, Clone)]
pub struct TransactionCoordinator {
    engine: Arc<ResilienceEngine>,
    pool: Pool,
}

impl TransactionCoordinator {
    pub fn new(engine: Arc<ResilienceEngine>, pool: Pool) -> Self {
        Self { engine, pool }
    }

    /// Acquire a connection and begin a transaction on it.
    pub async fn begin(&self, deadline: Option<Instant>) -> DbResult<TransactionScope> {
        let target = self.pool.target();
        if !self.pool.capabilities().transactions {
            return Err(DbError::capability(target, "transactions").with_context(
                target,
                OperationKind::Transaction,
                0,
            ));
        }

        let pool = &self.pool;
        let conn = self
            .engine
            .run(target, OperationKind::Transaction, deadline, |_| async move {
                let mut conn = pool.acquire_by(deadline).await?;
                let begun = conn.connection()?.begin().await;
                conn.settle(begun)?;
                Ok(conn)
            })
            .await?;

        let id = uuid::Uuid::new_v4().to_string();
        debug!(target_id = %target, transaction_id = %id, connection_id = conn.id(), "Transaction started");
        Ok(TransactionScope {
            id,
            target: target.to_string(),
            conn: Some(conn),
            state: TransactionState::Active,
            log: Vec::new(),
            deadline,
            statement_timeout: self.engine.operation_timeout(),
            started_at: Instant::now(),
        })
    }

    /// Run `statements` in one transaction: commit if all succeed, otherwise
    /// roll back and return the failure.
    pub async fn execute_transaction(
        &self,
        statements: Vec<Statement>,
        deadline: Option<Instant>,
    ) -> DbResult<Vec<u64>> {
        let mut scope = self.begin(deadline).await?;
        let mut affected = Vec::with_capacity(statements.len());
        for stmt in statements {
            affected.push(scope.execute(stmt).await?);
        }
        scope.commit().await?;
        Ok(affected)
    }
}
