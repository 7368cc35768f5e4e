//! Data models shared by the access layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{BackendKind, Capabilities, ConnectionConfig, ConnectionConfigError};
pub use query::{OperationKind, QueryParam, Record, Statement};
