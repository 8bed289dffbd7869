//! Buffered audit trail
//!
//! Audit events are redacted, queued per (tenant, schema) buffer, and
//! flushed in batches to pluggable writers. Writers are best-effort: a
//! failed write is logged and dropped, never surfaced to the business
//! operation that produced the event.

use crate::config::{AuditConfig, REDACTED};
use crate::error::Result;
use crate::types::AuditEvent;
use async_trait::async_trait;
use serde_json::Value;

pub mod buffer;
pub mod db;
pub mod file;
pub mod memory;

pub use buffer::{AuditBuffer, AuditBufferManager, BufferKey};
pub use db::DbAuditWriter;
pub use file::FileAuditWriter;
pub use memory::MemoryAuditWriter;

/// Durable sink for flushed audit batches
#[async_trait]
pub trait AuditWriter: Send + Sync {
    /// Persist a batch of events
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<()>;

    /// Release resources (open files, etc.)
    ///
    /// Default implementation does nothing.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Writer name for diagnostics (e.g., "file", "database")
    fn name(&self) -> &str;
}

/// Replace sensitive fields in the event's snapshots with a placeholder
pub fn redact_event(event: &mut AuditEvent, config: &AuditConfig) {
    if let Some(before) = event.before.as_mut() {
        redact_value(before, config);
    }
    if let Some(after) = event.after.as_mut() {
        redact_value(after, config);
    }
}

/// Recursively redact sensitive keys in objects and arrays
pub fn redact_value(value: &mut Value, config: &AuditConfig) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if config.is_sensitive(key) {
                    *v = Value::String(REDACTED.to_string());
                } else {
                    redact_value(v, config);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_value(item, config);
            }
        }
        _ => {}
    }
}
