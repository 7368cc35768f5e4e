//! Connection-related data models.
//!
//! This module defines types for backend target configuration and capabilities.

use crate::config::PoolOptions;
use serde::{Deserialize, Serialize};

/// Supported backend variants. Selected explicitly from the connection string scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
    /// In-process document store
    Memory,
}

impl BackendKind {
    /// Parse backend kind from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else if lower.starts_with("memory:") {
            Some(Self::Memory)
        } else {
            None
        }
    }

    /// Get the display name for this backend.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
            Self::Memory => "Memory",
        }
    }

    /// Whether the backend is a relational store driven through sqlx.
    pub fn is_relational(&self) -> bool {
        !matches!(self, Self::Memory)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Optional features a backend variant may or may not provide.
///
/// Callers query these flags instead of assuming uniform behaviour; an
/// operation that needs a missing capability fails with `DbError::Capability`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub transactions: bool,
    pub savepoints: bool,
    /// A partially consumed cursor can be resumed after a failure.
    pub resumable_cursors: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            transactions: true,
            savepoints: true,
            resumable_cursors: false,
        }
    }
}

/// Configuration for one backend target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub id: String,
    pub backend: BackendKind,
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub connection_string: String,
    /// Connection pool configuration options.
    #[serde(default)]
    pub pool_options: PoolOptions,
}

impl ConnectionConfig {
    /// Create a new target configuration.
    pub fn new(
        id: impl Into<String>,
        connection_string: impl Into<String>,
        pool_options: PoolOptions,
    ) -> Result<Self, ConnectionConfigError> {
        let id = id.into();
        let connection_string = connection_string.into();

        // Validate ID
        if id.is_empty() {
            return Err(ConnectionConfigError::EmptyId);
        }
        if !id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConnectionConfigError::InvalidId(id));
        }

        let backend = BackendKind::from_connection_string(&connection_string)
            .ok_or_else(|| ConnectionConfigError::UnknownBackend(connection_string.clone()))?;

        pool_options
            .validate()
            .map_err(ConnectionConfigError::InvalidPoolOptions)?;

        Ok(Self {
            id,
            backend,
            connection_string,
            pool_options,
        })
    }

    /// Get a display-safe version of the connection string (credentials masked).
    pub fn masked_connection_string(&self) -> String {
        if let Some(at_pos) = self.connection_string.find('@') {
            if let Some(colon_pos) = self.connection_string[..at_pos].rfind(':') {
                let prefix = &self.connection_string[..colon_pos + 1];
                // "scheme:" is not a password separator
                if !prefix.ends_with("//") && prefix.contains("//") {
                    let suffix = &self.connection_string[at_pos..];
                    return format!("{}****{}", prefix, suffix);
                }
            }
        }
        self.connection_string.clone()
    }
}

/// Errors that can occur when creating a target configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionConfigError {
    /// Target ID is empty
    #[error("Target ID cannot be empty")]
    EmptyId,

    /// Target ID contains invalid characters
    #[error("Target ID contains invalid characters: {0}")]
    InvalidId(String),

    /// Could not determine backend from connection string
    #[error("Unknown backend in connection string: {0}")]
    UnknownBackend(String),

    #[error("Invalid pool options: {0}")]
    InvalidPoolOptions(String),
}
