//! Error types for the resilient data access layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Every error surfaced by the core components is wrapped in [`DbError::Context`] so
//! callers can see which target, which kind of operation and how many attempts were
//! involved before deciding on further escalation.

use crate::models::OperationKind;
use thiserror::Error;

/// Fieldless mirror of the error taxonomy, used for matching and for
/// configuring which kinds a retry policy treats as retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    PoolTimeout,
    CircuitOpen,
    QueryExecution,
    StreamInterrupted,
    BulkWrite,
    TransactionAborted,
    Capability,
    Cancelled,
    Timeout,
    InvalidInput,
    TargetNotFound,
    Internal,
}

/// Retry classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeouts, connection resets: worth another attempt.
    Transient,
    /// Authentication, malformed requests: retrying cannot help.
    Fatal,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, transient: bool },

    #[error("Pool timeout: no connection available for '{target}' within {waited_ms}ms")]
    PoolTimeout { target: String, waited_ms: u64 },

    #[error("Circuit open for '{target}': failing fast, retry in {retry_after_ms}ms")]
    CircuitOpen { target: String, retry_after_ms: u64 },

    #[error("Query execution failed: {message}")]
    QueryExecution {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        transient: bool,
    },

    #[error("Stream interrupted after {delivered} records: {cause}")]
    StreamInterrupted {
        delivered: u64,
        #[source]
        cause: Box<DbError>,
    },

    #[error(
        "Bulk write partially failed: {succeeded} records written, failed chunks {failed_chunks:?}"
    )]
    BulkWrite {
        succeeded: u64,
        failed_chunks: Vec<usize>,
    },

    #[error("Transaction aborted: {cause} (transaction: {transaction_id})")]
    TransactionAborted {
        transaction_id: String,
        #[source]
        cause: Box<DbError>,
    },

    #[error("Capability not supported by {backend}: {capability}")]
    Capability { backend: String, capability: String },

    #[error("Operation cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Target not found: {target}")]
    TargetNotFound { target: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("{source} (target: {target}, operation: {operation}, attempts: {attempts})")]
    Context {
        target: String,
        operation: OperationKind,
        attempts: u32,
        #[source]
        source: Box<DbError>,
    },
}

impl DbError {
    /// Create a connection error that is worth retrying (reset, refused, dropped).
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            transient: true,
        }
    }

    /// Create a connection error that retrying cannot fix (bad credentials, bad config).
    pub fn connection_fatal(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            transient: false,
        }
    }

    pub fn pool_timeout(target: impl Into<String>, waited_ms: u64) -> Self {
        Self::PoolTimeout {
            target: target.into(),
            waited_ms,
        }
    }

    pub fn circuit_open(target: impl Into<String>, retry_after_ms: u64) -> Self {
        Self::CircuitOpen {
            target: target.into(),
            retry_after_ms,
        }
    }

    /// Create a non-retryable query error with optional SQL state.
    pub fn query(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::QueryExecution {
            message: message.into(),
            sql_state,
            transient: false,
        }
    }

    /// Create a query error caused by a transient backend condition
    /// (serialization failure, deadlock, admin shutdown).
    pub fn query_transient(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::QueryExecution {
            message: message.into(),
            sql_state,
            transient: true,
        }
    }

    pub fn stream_interrupted(delivered: u64, cause: DbError) -> Self {
        Self::StreamInterrupted {
            delivered,
            cause: Box::new(cause),
        }
    }

    pub fn bulk_write(succeeded: u64, failed_chunks: Vec<usize>) -> Self {
        Self::BulkWrite {
            succeeded,
            failed_chunks,
        }
    }

    pub fn transaction_aborted(transaction_id: impl Into<String>, cause: DbError) -> Self {
        Self::TransactionAborted {
            transaction_id: transaction_id.into(),
            cause: Box::new(cause),
        }
    }

    pub fn capability(backend: impl Into<String>, capability: impl Into<String>) -> Self {
        Self::Capability {
            backend: backend.into(),
            capability: capability.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn target_not_found(target: impl Into<String>) -> Self {
        Self::TargetNotFound {
            target: target.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Attach target identity, operation kind and attempt count.
    ///
    /// An error that already carries context is re-labelled rather than nested.
    pub fn with_context(
        self,
        target: impl Into<String>,
        operation: OperationKind,
        attempts: u32,
    ) -> Self {
        let source = match self {
            Self::Context { source, .. } => source,
            other => Box::new(other),
        };
        Self::Context {
            target: target.into(),
            operation,
            attempts,
            source,
        }
    }

    /// The underlying error with any context wrapper removed.
    pub fn root(&self) -> &DbError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Consume the error and return the underlying error without context.
    pub fn into_root(self) -> DbError {
        match self {
            Self::Context { source, .. } => source.into_root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Context { source, .. } => source.kind(),
            Self::Connection { .. } => ErrorKind::Connection,
            Self::PoolTimeout { .. } => ErrorKind::PoolTimeout,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::QueryExecution { .. } => ErrorKind::QueryExecution,
            Self::StreamInterrupted { .. } => ErrorKind::StreamInterrupted,
            Self::BulkWrite { .. } => ErrorKind::BulkWrite,
            Self::TransactionAborted { .. } => ErrorKind::TransactionAborted,
            Self::Capability { .. } => ErrorKind::Capability,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::TargetNotFound { .. } => ErrorKind::TargetNotFound,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Classify this error as transient or fatal.
    pub fn classify(&self) -> FailureClass {
        let transient = match self.root() {
            Self::Connection { transient, .. } => *transient,
            Self::QueryExecution { transient, .. } => *transient,
            Self::PoolTimeout { .. } | Self::Timeout { .. } => true,
            _ => false,
        };
        if transient {
            FailureClass::Transient
        } else {
            FailureClass::Fatal
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.classify() == FailureClass::Transient
    }

    /// Attempt count recorded in the context wrapper, if any.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Context { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Target recorded in the context wrapper, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Context { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Operation kind recorded in the context wrapper, if any.
    pub fn operation(&self) -> Option<OperationKind> {
        match self {
            Self::Context { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

/// SQLSTATE classes that describe a condition which may clear on its own.
fn is_transient_sql_state(code: &str) -> bool {
    // 08xxx connection exception, 40001 serialization failure, 40P01 deadlock,
    // 57P01..57P03 admin shutdown / cannot connect now, 53300 too many connections
    code.starts_with("08")
        || code == "40001"
        || code == "40P01"
        || code.starts_with("57P0")
        || code == "53300"
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection_fatal(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let message = db_err.message().to_string();
                match code.as_deref() {
                    // 28xxx invalid authorization
                    Some(c) if c.starts_with("28") => DbError::connection_fatal(message),
                    Some(c) if is_transient_sql_state(c) => DbError::query_transient(message, code),
                    _ => DbError::query(message, code),
                }
            }
            sqlx::Error::RowNotFound => DbError::query("No rows returned", None),
            sqlx::Error::PoolTimedOut => DbError::timeout("driver pool acquire", 0),
            sqlx::Error::PoolClosed => DbError::connection_fatal("Driver pool is closed"),
            sqlx::Error::Io(io_err) => DbError::connection(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => {
                DbError::connection_fatal(format!("TLS error: {}", tls_err))
            }
            sqlx::Error::Protocol(msg) => DbError::connection(format!("Protocol error: {}", msg)),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::query(format!("Type not found: {}", type_name), None)
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::query(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
