//! Error types for a3s-tenant-db

use thiserror::Error;

/// Errors that can occur in the tenant data layer
#[derive(Debug, Error)]
pub enum DbError {
    /// Store unreachable, credentials rejected, or handle already closed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection creation or another bounded operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The store rejected an operation
    #[error("Query '{operation}' on model '{model}' failed: {reason}")]
    Query {
        model: String,
        operation: String,
        reason: String,
    },

    /// A `*_or_throw` lookup, update, or delete matched no row
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// An audit writer failed to persist a batch
    #[error("Audit writer '{writer}' failed: {reason}")]
    AuditWrite { writer: String, reason: String },
}

/// Result type alias for tenant data operations
pub type Result<T> = std::result::Result<T, DbError>;
