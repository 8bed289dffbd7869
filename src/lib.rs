//! # a3s-tenant-db
//!
//! Tenant-scoped data access with cross-cutting query behavior and a
//! buffered audit trail.
//!
//! ## Overview
//!
//! `a3s-tenant-db` hands each tenant its own store connection, decorated by
//! a fixed pipeline that hides soft-deleted rows, trims string input, and
//! records every mutation as an audit event. Audit events are buffered per
//! (tenant, schema) and flushed in batches to files and/or the tenant's own
//! activity table, without ever failing the business operation.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use a3s_tenant_db::{
//!     with_context, AuditBufferManager, AuditConfig, ConnectionConfig, ConnectionRegistry,
//!     QueryContext,
//! };
//! use a3s_tenant_db::store::memory::MemoryDriver;
//!
//! # async fn example() -> a3s_tenant_db::Result<()> {
//! let audit = Arc::new(AuditBufferManager::new(AuditConfig::default()));
//! let registry = ConnectionRegistry::new(MemoryDriver::new(), audit);
//!
//! let ctx = QueryContext::new("T1", "user-42");
//! with_context(ctx, async {
//!     let client = registry
//!         .obtain("T1", &ConnectionConfig::new("memory://erp?schema=tenant_a"))
//!         .await?;
//!
//!     // stored as "Acme", audited with actor "user-42"
//!     client.create("tb_order", serde_json::json!({"customer": "  Acme  "})).await?;
//!     Ok::<_, a3s_tenant_db::DbError>(())
//! })
//! .await?;
//!
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **ConnectionRegistry**: per-tenant, single-flight connection cache
//! - **TenantClient**: handle that runs operations through the pipeline
//! - **Pipeline** / **Stage**: ordered interceptors: soft-delete, normalize, audit
//! - **AuditBufferManager**: per-(tenant, schema) buffers with size and time flushes
//! - **AuditWriter** trait: file, database, and in-memory sinks
//! - **StoreDriver** / **StoreConnection** traits: the underlying store
//! - **QueryContext**: task-local request context for audit attribution

pub mod audit;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod types;

// Re-export core types
pub use audit::{AuditBufferManager, AuditWriter, DbAuditWriter, FileAuditWriter, MemoryAuditWriter};
pub use client::TenantClient;
pub use config::{AuditConfig, ConnectionConfig, RotationStrategy};
pub use context::{current_context, with_context, QueryContext};
pub use error::{DbError, Result};
pub use pipeline::{AuditCapture, InputNormalizer, Next, Pipeline, SoftDeleteFilter, Stage};
pub use registry::{ConnectionRegistry, TenantConnectionEntry};
pub use store::{StoreConnection, StoreDriver};
pub use types::{AuditAction, AuditEvent, AuditMetadata, Operation, OperationKind, QueryArgs};

// Re-export the in-memory driver for convenience
pub use store::memory::MemoryDriver;
