//! Store driver traits: the core abstraction for tenant data backends
//!
//! A `StoreDriver` opens connections from a `ConnectionConfig`; a
//! `StoreConnection` executes operations. Interception happens above this
//! layer, so drivers only see already-rewritten operations.

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::types::Operation;
use async_trait::async_trait;
use serde_json::Value;

pub mod memory;

/// Opens connections to a tenant data store
#[async_trait]
pub trait StoreDriver: Send + Sync {
    /// Connect to the store described by `config`
    ///
    /// Fails with `DbError::Connection` when the store is unreachable or
    /// rejects the credentials.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn StoreConnection>>;

    /// Driver name (e.g., "memory", "postgres")
    fn name(&self) -> &str;
}

/// A live connection to one tenant's store
#[async_trait]
pub trait StoreConnection: Send + Sync {
    /// Execute an operation, returning the row, rows, count, or aggregate
    async fn execute(&self, op: &Operation) -> Result<Value>;

    /// Verify the connection is usable, reconnecting if it dropped
    ///
    /// Fails when the connection was closed or the store is unreachable.
    async fn ensure_connected(&self) -> Result<()>;

    /// Close the connection; subsequent `execute` calls fail
    async fn close(&self) -> Result<()>;

    /// Whether `close` has been called
    fn is_closed(&self) -> bool;
}
