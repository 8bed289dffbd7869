//! In-memory audit writer for development and testing

use super::AuditWriter;
use crate::error::{DbError, Result};
use crate::types::AuditEvent;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Stores every written event in a `Vec`
///
/// Clones share the same storage, so a test can keep one clone and hand
/// another to the buffer manager.
#[derive(Clone, Default)]
pub struct MemoryAuditWriter {
    events: Arc<RwLock<Vec<AuditEvent>>>,
    batches: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl MemoryAuditWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// All events written so far, oldest first
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.events.read().await.len()
    }

    /// Number of successful `write_batch` calls
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuditWriter for MemoryAuditWriter {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DbError::AuditWrite {
                writer: self.name().to_string(),
                reason: "simulated failure".to_string(),
            });
        }
        self.events.write().await.extend_from_slice(events);
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuditAction, OperationKind};

    fn event(model: &str) -> AuditEvent {
        AuditEvent::new("T1", "s", model, OperationKind::Create, AuditAction::Create, "u")
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let writer = MemoryAuditWriter::new();
        writer.write_batch(&[event("a"), event("b")]).await.unwrap();
        writer.write_batch(&[event("c")]).await.unwrap();

        let events = writer.events().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].model, "c");
        assert_eq!(writer.batches(), 2);
    }

    #[tokio::test]
    async fn test_failing_writer() {
        let writer = MemoryAuditWriter::new();
        writer.set_failing(true);
        let err = writer.write_batch(&[event("a")]).await.unwrap_err();
        assert!(matches!(err, DbError::AuditWrite { .. }));
        assert_eq!(writer.count().await, 0);

        writer.set_failing(false);
        writer.write_batch(&[event("a")]).await.unwrap();
        assert_eq!(writer.count().await, 1);
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let writer = MemoryAuditWriter::new();
        let clone = writer.clone();
        clone.write_batch(&[event("a")]).await.unwrap();
        assert_eq!(writer.count().await, 1);
    }
}
