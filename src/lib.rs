//! Resilient DB Library
//!
//! This library provides a resilient, pooled access layer over relational
//! (SQLite, PostgreSQL, MySQL) and in-memory document stores: connection
//! pooling, circuit breaking with retries, streaming reads, bulk writes,
//! transactions and bounded concurrent dispatch.

pub mod backend;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod resilience;

pub use config::Config;
pub use db::ConnectionManager;
pub use error::{DbError, DbResult};
