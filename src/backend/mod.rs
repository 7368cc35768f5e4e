//! Backend capability interface.
//!
//! Every backend variant implements [`ConnectionFactory`] once, and hands out
//! [`Connection`] objects that the pool owns while idle. The core never inspects
//! concrete connection types; optional features are advertised through
//! [`Capabilities`] and checked before use.
//!
//! - `memory`: in-process document store with fault injection
//! - `relational`: PostgreSQL, MySQL and SQLite over single sqlx connections

pub mod memory;
pub mod relational;

use crate::error::{DbError, DbResult};
use crate::models::{BackendKind, Capabilities, ConnectionConfig, Record, Statement};
use async_trait::async_trait;
use std::sync::Arc;

pub use memory::{Fault, FaultPoint, MemoryBackend};
pub use relational::SqlxFactory;

/// A single live session with a backend target.
///
/// A connection has exactly one owner at a time: the pool while idle, one
/// caller while checked out. At most one cursor may be open per connection.
#[async_trait]
pub trait Connection: Send {
    /// Cheap liveness probe.
    async fn ping(&mut self) -> DbResult<()>;

    /// Run a statement and return the number of affected rows or documents.
    async fn execute(&mut self, stmt: &Statement) -> DbResult<u64>;

    /// Run a statement and materialize every returned record.
    async fn query(&mut self, stmt: &Statement) -> DbResult<Vec<Record>>;

    /// Open a server-side or emulated cursor over the statement's results.
    async fn open_cursor(&mut self, stmt: &Statement) -> DbResult<()>;

    /// Fetch up to `max` records from the open cursor, in order.
    ///
    /// Fewer than `max` records means the cursor is drained.
    async fn fetch_cursor(&mut self, max: usize) -> DbResult<Vec<Record>>;

    async fn close_cursor(&mut self) -> DbResult<()>;

    /// Write `records` into the table or collection named `target` as one
    /// backend round trip.
    async fn insert_many(&mut self, target: &str, records: &[Record]) -> DbResult<u64>;

    async fn begin(&mut self) -> DbResult<()>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    async fn savepoint(&mut self, name: &str) -> DbResult<()> {
        let _ = name;
        Err(DbError::capability(self.backend_name(), "savepoints"))
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()> {
        let _ = name;
        Err(DbError::capability(self.backend_name(), "savepoints"))
    }

    /// Gracefully end the session. The connection must not be used afterwards.
    async fn close(&mut self) -> DbResult<()>;

    fn capabilities(&self) -> Capabilities;

    fn backend_name(&self) -> &'static str;
}

/// Creates raw connections for one target. Supplied by the backend variant.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> Capabilities;

    async fn connect(&self) -> DbResult<Box<dyn Connection>>;
}

/// Select the factory for a target from its backend kind.
pub fn factory_for(config: &ConnectionConfig) -> DbResult<Arc<dyn ConnectionFactory>> {
    match config.backend {
        BackendKind::Memory => {
            let name = config
                .connection_string
                .split_once(':')
                .map(|(_, rest)| rest.trim_start_matches('/'))
                .filter(|rest| !rest.is_empty())
                .unwrap_or(config.id.as_str());
            Ok(Arc::new(MemoryBackend::new(name)))
        }
        BackendKind::PostgreSQL | BackendKind::MySQL | BackendKind::SQLite => Ok(Arc::new(
            SqlxFactory::new(config.backend, config.connection_string.clone())?,
        )),
    }
}
