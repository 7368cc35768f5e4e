//! Relational backend over single sqlx connections.
//!
//! Each pooled handle owns one driver connection (`PgConnection`,
//! `MySqlConnection` or `SqliteConnection`); pooling, retries and circuit
//! breaking happen above this layer. Cursors are emulated with bounded
//! LIMIT/OFFSET paging over the wrapped statement, so memory stays bounded by
//! the requested chunk size.

mod decode;

pub use decode::{RowToRecord, TypeCategory, categorize_type};

use super::{Connection, ConnectionFactory};
use crate::error::{DbError, DbResult};
use crate::models::{BackendKind, Capabilities, QueryParam, Record, Statement};
use async_trait::async_trait;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection};
use sqlx::types::Json;
use sqlx::{ConnectOptions, Executor, MySql, Postgres, Sqlite};
use std::str::FromStr;
use tracing::debug;

/// SQL dialect of a relational target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Postgres,
    Sqlite,
}

impl Dialect {
    fn from_kind(kind: BackendKind) -> Option<Self> {
        match kind {
            BackendKind::PostgreSQL => Some(Self::Postgres),
            BackendKind::MySQL => Some(Self::MySql),
            BackendKind::SQLite => Some(Self::Sqlite),
            BackendKind::Memory => None,
        }
    }

    fn kind(self) -> BackendKind {
        match self {
            Self::Postgres => BackendKind::PostgreSQL,
            Self::MySql => BackendKind::MySQL,
            Self::Sqlite => BackendKind::SQLite,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }

    /// Quote an identifier, keeping a `schema.table` qualification intact.
    pub fn quote_identifier(self, ident: &str) -> String {
        let (open, close) = match self {
            Self::MySql => ('`', '`'),
            Self::Postgres | Self::Sqlite => ('"', '"'),
        };
        ident
            .split('.')
            .map(|part| {
                let escaped = part.replace(close, &format!("{close}{close}"));
                format!("{open}{escaped}{close}")
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Positional placeholder for the `n`th (1-based) bound value.
    fn placeholder(self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${n}"),
            Self::MySql | Self::Sqlite => "?".to_string(),
        }
    }
}

/// Parsed connect options for one relational target.
#[derive(Debug, Clone)]
enum Options {
    Postgres(PgConnectOptions),
    MySql(MySqlConnectOptions),
    Sqlite(SqliteConnectOptions),
}

/// Connection factory for PostgreSQL, MySQL and SQLite targets.
#[derive(Debug, Clone)]
pub struct SqlxFactory {
    dialect: Dialect,
    options: Options,
}

impl SqlxFactory {
    pub fn new(kind: BackendKind, connection_string: String) -> DbResult<Self> {
        let dialect = Dialect::from_kind(kind).ok_or_else(|| {
            DbError::invalid_input(format!("{kind} is not a relational backend"))
        })?;
        let invalid = |e: sqlx::Error| {
            DbError::connection_fatal(format!("Invalid {kind} connection string: {e}"))
        };
        let options = match dialect {
            Dialect::Postgres => {
                Options::Postgres(PgConnectOptions::from_str(&connection_string).map_err(invalid)?)
            }
            Dialect::MySql => Options::MySql(
                MySqlConnectOptions::from_str(&connection_string)
                    .map_err(invalid)?
                    .charset("utf8mb4"),
            ),
            Dialect::Sqlite => Options::Sqlite(
                SqliteConnectOptions::from_str(&connection_string)
                    .map_err(invalid)?
                    .create_if_missing(true),
            ),
        };
        Ok(Self { dialect, options })
    }
}

#[async_trait]
impl ConnectionFactory for SqlxFactory {
    fn kind(&self) -> BackendKind {
        self.dialect.kind()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transactions: true,
            savepoints: true,
            resumable_cursors: false,
        }
    }

    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        let driver = match &self.options {
            Options::Postgres(o) => Driver::Postgres(o.connect().await?),
            Options::MySql(o) => Driver::MySql(o.connect().await?),
            Options::Sqlite(o) => Driver::Sqlite(o.connect().await?),
        };
        debug!(backend = self.dialect.name(), "Opened relational connection");
        Ok(Box::new(SqlxConnection {
            dialect: self.dialect,
            driver: Some(driver),
            cursor: None,
        }))
    }
}

enum Driver {
    Postgres(PgConnection),
    MySql(MySqlConnection),
    Sqlite(SqliteConnection),
}

/// Dispatch one expression over the driver variants, binding `$c` to the
/// concrete connection.
macro_rules! with_driver {
    ($driver:expr, $c:ident => $body:expr) => {
        match $driver {
            Driver::Postgres($c) => $body,
            Driver::MySql($c) => $body,
            Driver::Sqlite($c) => $body,
        }
    };
}

fn bind_postgres<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

fn bind_mysql<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    param: &'q QueryParam,
) -> Query<'q, MySql, MySqlArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

fn bind_sqlite<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q QueryParam,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        // SQLite doesn't have native JSON type, store as string
        QueryParam::Json(v) => query.bind(v.to_string()),
    }
}

impl Driver {
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let result = match self {
            Self::Postgres(c) => {
                params
                    .iter()
                    .fold(sqlx::query(sql), bind_postgres)
                    .execute(&mut *c)
                    .await?
                    .rows_affected()
            }
            Self::MySql(c) => {
                params
                    .iter()
                    .fold(sqlx::query(sql), bind_mysql)
                    .execute(&mut *c)
                    .await?
                    .rows_affected()
            }
            Self::Sqlite(c) => {
                params
                    .iter()
                    .fold(sqlx::query(sql), bind_sqlite)
                    .execute(&mut *c)
                    .await?
                    .rows_affected()
            }
        };
        Ok(result)
    }

    async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Record>> {
        let records = match self {
            Self::Postgres(c) => params
                .iter()
                .fold(sqlx::query(sql), bind_postgres)
                .fetch_all(&mut *c)
                .await?
                .iter()
                .map(RowToRecord::to_record)
                .collect(),
            Self::MySql(c) => params
                .iter()
                .fold(sqlx::query(sql), bind_mysql)
                .fetch_all(&mut *c)
                .await?
                .iter()
                .map(RowToRecord::to_record)
                .collect(),
            Self::Sqlite(c) => params
                .iter()
                .fold(sqlx::query(sql), bind_sqlite)
                .fetch_all(&mut *c)
                .await?
                .iter()
                .map(RowToRecord::to_record)
                .collect(),
        };
        Ok(records)
    }

    /// Run unprepared SQL (transaction control).
    async fn raw(&mut self, sql: &str) -> DbResult<()> {
        with_driver!(self, c => { c.execute(sql).await?; });
        Ok(())
    }
}

#[derive(Debug)]
struct PagingCursor {
    statement: Statement,
    offset: u64,
}

/// One relational session.
pub struct SqlxConnection {
    dialect: Dialect,
    driver: Option<Driver>,
    cursor: Option<PagingCursor>,
}

impl SqlxConnection {
    fn driver(&mut self) -> DbResult<&mut Driver> {
        self.driver
            .as_mut()
            .ok_or_else(|| DbError::connection_fatal("relational connection is closed"))
    }

    fn page_sql(&self, sql: &str, limit: usize, offset: u64) -> String {
        let inner = sql.trim().trim_end_matches(';');
        format!("SELECT * FROM ({inner}) AS page_src LIMIT {limit} OFFSET {offset}")
    }
}

/// Build a multi-row INSERT covering the union of all record fields.
///
/// Returns the SQL and the values in bind order; absent fields bind NULL.
pub fn build_insert(
    dialect: Dialect,
    target: &str,
    records: &[Record],
) -> DbResult<(String, Vec<QueryParam>)> {
    let mut columns: Vec<&str> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }
    if columns.is_empty() {
        return Err(DbError::invalid_input("records have no fields to insert"));
    }

    let mut params = Vec::with_capacity(records.len() * columns.len());
    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let mut row = Vec::with_capacity(columns.len());
        for column in &columns {
            params.push(
                record
                    .get(*column)
                    .map(QueryParam::from_json)
                    .unwrap_or(QueryParam::Null),
            );
            row.push(dialect.placeholder(params.len()));
        }
        rows.push(format!("({})", row.join(", ")));
    }

    let column_list = columns
        .iter()
        .map(|c| dialect.quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        dialect.quote_identifier(target),
        column_list,
        rows.join(", ")
    );
    Ok((sql, params))
}

fn check_savepoint_name(name: &str) -> DbResult<()> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(DbError::invalid_input(format!("invalid savepoint name '{name}'")))
    }
}

#[async_trait]
impl Connection for SqlxConnection {
    async fn ping(&mut self) -> DbResult<()> {
        with_driver!(self.driver()?, c => sqlx::Connection::ping(c).await?);
        Ok(())
    }

    async fn execute(&mut self, stmt: &Statement) -> DbResult<u64> {
        self.driver()?.execute(&stmt.text, &stmt.params).await
    }

    async fn query(&mut self, stmt: &Statement) -> DbResult<Vec<Record>> {
        self.driver()?.fetch_all(&stmt.text, &stmt.params).await
    }

    async fn open_cursor(&mut self, stmt: &Statement) -> DbResult<()> {
        if self.cursor.is_some() {
            return Err(DbError::invalid_input("a cursor is already open on this connection"));
        }
        // Surface a broken statement at open time rather than on the first page
        let probe = self.page_sql(&stmt.text, 0, 0);
        self.driver()?.fetch_all(&probe, &stmt.params).await?;
        self.cursor = Some(PagingCursor {
            statement: stmt.clone(),
            offset: 0,
        });
        Ok(())
    }

    async fn fetch_cursor(&mut self, max: usize) -> DbResult<Vec<Record>> {
        let (sql, params) = match &self.cursor {
            Some(cursor) => (
                self.page_sql(&cursor.statement.text, max, cursor.offset),
                cursor.statement.params.clone(),
            ),
            None => return Err(DbError::invalid_input("no cursor is open on this connection")),
        };
        let page = self.driver()?.fetch_all(&sql, &params).await?;
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.offset += page.len() as u64;
        }
        Ok(page)
    }

    async fn close_cursor(&mut self) -> DbResult<()> {
        self.cursor = None;
        Ok(())
    }

    async fn insert_many(&mut self, target: &str, records: &[Record]) -> DbResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let (sql, params) = build_insert(self.dialect, target, records)?;
        self.driver()?.execute(&sql, &params).await
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.driver()?.raw("BEGIN").await
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.driver()?.raw("COMMIT").await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.driver()?.raw("ROLLBACK").await
    }

    async fn savepoint(&mut self, name: &str) -> DbResult<()> {
        check_savepoint_name(name)?;
        self.driver()?.raw(&format!("SAVEPOINT {name}")).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()> {
        check_savepoint_name(name)?;
        self.driver()?
            .raw(&format!("ROLLBACK TO SAVEPOINT {name}"))
            .await
    }

    async fn close(&mut self) -> DbResult<()> {
        self.cursor = None;
        if let Some(driver) = self.driver.take() {
            with_driver!(driver, c => sqlx::Connection::close(c).await?);
        }
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transactions: true,
            savepoints: true,
            resumable_cursors: false,
        }
    }

    fn backend_name(&self) -> &'static str {
        self.dialect.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: serde_json::Value) -> Record {
        match v {
            serde_json::Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(Dialect::Postgres.quote_identifier("orders"), "\"orders\"");
        assert_eq!(Dialect::MySql.quote_identifier("sales.orders"), "`sales`.`orders`");
        assert_eq!(Dialect::Sqlite.quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_build_insert_postgres_placeholders() {
        let records = vec![
            record(json!({"id": 1, "name": "a"})),
            record(json!({"id": 2, "name": "b"})),
        ];
        let (sql, params) = build_insert(Dialect::Postgres, "users", &records).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"users\" (\"id\", \"name\") VALUES ($1, $2), ($3, $4)"
        );
        assert_eq!(params.len(), 4);
        assert_eq!(params[2], QueryParam::Int(2));
    }

    #[test]
    fn test_build_insert_fills_missing_fields_with_null() {
        let records = vec![record(json!({"id": 1})), record(json!({"id": 2, "note": "x"}))];
        let (sql, params) = build_insert(Dialect::Sqlite, "t", &records).unwrap();
        assert_eq!(sql, "INSERT INTO \"t\" (\"id\", \"note\") VALUES (?, ?), (?, ?)");
        assert_eq!(params[1], QueryParam::Null);
    }

    #[test]
    fn test_build_insert_rejects_empty_records() {
        let records = vec![Record::new()];
        assert!(build_insert(Dialect::MySql, "t", &records).is_err());
    }

    #[test]
    fn test_savepoint_names() {
        assert!(check_savepoint_name("sp_1").is_ok());
        assert!(check_savepoint_name("1sp").is_err());
        assert!(check_savepoint_name("sp; DROP TABLE x").is_err());
    }

    #[test]
    fn test_factory_rejects_memory_kind() {
        assert!(SqlxFactory::new(BackendKind::Memory, "memory:x".into()).is_err());
    }
}
