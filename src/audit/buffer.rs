//! Per-(tenant, schema) audit buffers with size- and time-triggered flushes
//!
//! Flushing takes the queued events out under the entry lock and hands the
//! batch to every active writer. Flushes of one buffer are serialized, so an
//! event enqueued mid-flush lands in the next batch: each event is written
//! exactly once.

use super::{redact_event, AuditWriter, FileAuditWriter};
use crate::config::AuditConfig;
use crate::error::{DbError, Result};
use crate::types::AuditEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Identity of one audit buffer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub tenant_id: String,
    pub schema_key: String,
}

impl BufferKey {
    pub fn new(tenant_id: impl Into<String>, schema_key: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            schema_key: schema_key.into(),
        }
    }
}

/// Queue of audit events for one (tenant, schema)
pub struct AuditBuffer {
    key: BufferKey,
    entries: Mutex<Vec<AuditEvent>>,
    max_size: usize,
    flush_lock: tokio::sync::Mutex<()>,
    file_writer: Option<Arc<dyn AuditWriter>>,
    db_writer: RwLock<Option<Arc<dyn AuditWriter>>>,
    extra_writers: Vec<Arc<dyn AuditWriter>>,
    save_to_database: bool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl AuditBuffer {
    fn new(key: BufferKey, config: &AuditConfig, extra_writers: Vec<Arc<dyn AuditWriter>>) -> Self {
        let file_writer: Option<Arc<dyn AuditWriter>> = if config.save_to_file {
            Some(Arc::new(FileAuditWriter::for_schema(config, &key.schema_key)))
        } else {
            None
        };

        Self {
            key,
            entries: Mutex::new(Vec::new()),
            max_size: config.buffer_size.max(1),
            flush_lock: tokio::sync::Mutex::new(()),
            file_writer,
            db_writer: RwLock::new(None),
            extra_writers,
            save_to_database: config.save_to_database,
            timer: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &BufferKey {
        &self.key
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue an event, returning the queue length after the push
    fn push(&self, event: AuditEvent) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.push(event);
        entries.len()
    }

    fn set_db_writer(&self, writer: Arc<dyn AuditWriter>) {
        let mut slot = self.db_writer.write().unwrap_or_else(|p| p.into_inner());
        *slot = Some(writer);
    }

    fn writers(&self) -> Vec<Arc<dyn AuditWriter>> {
        let mut writers: Vec<Arc<dyn AuditWriter>> = Vec::new();
        if let Some(file) = &self.file_writer {
            writers.push(file.clone());
        }
        if self.save_to_database {
            let db = self.db_writer.read().unwrap_or_else(|p| p.into_inner());
            if let Some(db) = db.as_ref() {
                writers.push(db.clone());
            }
        }
        writers.extend(self.extra_writers.iter().cloned());
        writers
    }

    /// Timer callback: flush whatever is queued (possibly nothing)
    pub async fn tick(&self) -> usize {
        self.flush().await
    }

    /// Hand every queued event to the active writers
    ///
    /// Returns the number of events taken from the queue. Writer failures
    /// are logged per writer and do not affect the others.
    pub async fn flush(&self) -> usize {
        let _guard = self.flush_lock.lock().await;

        let batch = {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *entries)
        };
        if batch.is_empty() {
            return 0;
        }

        let writers = self.writers();
        if writers.is_empty() {
            tracing::debug!(
                tenant = %self.key.tenant_id,
                schema = %self.key.schema_key,
                count = batch.len(),
                "No audit writers enabled, dropping batch"
            );
            return batch.len();
        }

        let results =
            futures::future::join_all(writers.iter().map(|w| w.write_batch(&batch))).await;
        for (writer, result) in writers.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(
                    tenant = %self.key.tenant_id,
                    schema = %self.key.schema_key,
                    writer = writer.name(),
                    count = batch.len(),
                    error = %e,
                    "Audit writer failed"
                );
            }
        }

        tracing::debug!(
            tenant = %self.key.tenant_id,
            schema = %self.key.schema_key,
            count = batch.len(),
            writers = writers.len(),
            "Audit buffer flushed"
        );
        batch.len()
    }

    async fn close_writers(&self) {
        let mut writers: Vec<Arc<dyn AuditWriter>> = Vec::new();
        if let Some(file) = &self.file_writer {
            writers.push(file.clone());
        }
        let db = self.db_writer.read().unwrap_or_else(|p| p.into_inner()).clone();
        writers.extend(db);

        for writer in writers {
            if let Err(e) = writer.close().await {
                tracing::warn!(writer = writer.name(), error = %e, "Failed to close audit writer");
            }
        }
    }

    fn stop_timer(&self) {
        if let Some(handle) = self.timer.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }
}

fn spawn_timer(buffer: &Arc<AuditBuffer>, period: Duration) -> Option<JoinHandle<()>> {
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            tracing::warn!(
                tenant = %buffer.key.tenant_id,
                schema = %buffer.key.schema_key,
                "No tokio runtime, audit buffer will only flush on size or shutdown"
            );
            return None;
        }
    };

    let weak: Weak<AuditBuffer> = Arc::downgrade(buffer);
    let period = period.max(Duration::from_millis(1));
    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(buffer) = weak.upgrade() else { break };
            buffer.tick().await;
        }
    }))
}

/// Owns every audit buffer of the process
///
/// Buffers are created lazily on first enqueue (or writer attach) and live
/// until `shutdown`. Each buffer gets its own flush timer.
pub struct AuditBufferManager {
    config: Arc<AuditConfig>,
    buffers: RwLock<HashMap<BufferKey, Arc<AuditBuffer>>>,
    extra_writers: Vec<Arc<dyn AuditWriter>>,
    shutting_down: AtomicBool,
}

impl AuditBufferManager {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config: Arc::new(config),
            buffers: RwLock::new(HashMap::new()),
            extra_writers: Vec::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Add a writer that receives the batches of every buffer
    pub fn with_writer(mut self, writer: impl AuditWriter + 'static) -> Self {
        self.extra_writers.push(Arc::new(writer));
        self
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    fn existing(&self, key: &BufferKey) -> Option<Arc<AuditBuffer>> {
        self.buffers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    fn buffer(&self, tenant_id: &str, schema_key: &str) -> Arc<AuditBuffer> {
        let key = BufferKey::new(tenant_id, schema_key);
        if let Some(buffer) = self.existing(&key) {
            return buffer;
        }

        let mut buffers = self.buffers.write().unwrap_or_else(|p| p.into_inner());
        if let Some(buffer) = buffers.get(&key) {
            return buffer.clone();
        }

        let buffer = Arc::new(AuditBuffer::new(
            key.clone(),
            &self.config,
            self.extra_writers.clone(),
        ));
        let timer = spawn_timer(&buffer, self.config.flush_interval());
        *buffer.timer.lock().unwrap_or_else(|p| p.into_inner()) = timer;
        buffers.insert(key, buffer.clone());

        tracing::info!(
            tenant = %tenant_id,
            schema = %schema_key,
            max_size = buffer.max_size,
            flush_interval_ms = self.config.flush_interval_ms,
            "Audit buffer created"
        );
        buffer
    }

    /// Bind the database writer of a tenant's buffer (replacing any previous one)
    pub fn attach_database_writer(
        &self,
        tenant_id: &str,
        schema_key: &str,
        writer: Arc<dyn AuditWriter>,
    ) {
        self.buffer(tenant_id, schema_key).set_db_writer(writer);
    }

    /// Redact and queue an event; flushes at once when the buffer is full
    ///
    /// The size-triggered flush runs on its own task, so it completes even
    /// if the caller is cancelled while awaiting it.
    pub async fn enqueue(&self, tenant_id: &str, schema_key: &str, mut event: AuditEvent) -> Result<()> {
        redact_event(&mut event, &self.config);

        let buffer = self.buffer(tenant_id, schema_key);
        let len = buffer.push(event);

        if len >= buffer.max_size || self.shutting_down.load(Ordering::SeqCst) {
            let flushing = buffer.clone();
            tokio::spawn(async move { flushing.flush().await })
                .await
                .map_err(|e| DbError::AuditWrite {
                    writer: "buffer".to_string(),
                    reason: format!("flush task failed: {}", e),
                })?;
        }
        Ok(())
    }

    /// Flush one buffer now; returns the number of events flushed
    pub async fn flush(&self, tenant_id: &str, schema_key: &str) -> usize {
        match self.existing(&BufferKey::new(tenant_id, schema_key)) {
            Some(buffer) => buffer.flush().await,
            None => 0,
        }
    }

    /// Flush every buffer; returns the total number of events flushed
    pub async fn flush_all(&self) -> usize {
        let buffers: Vec<Arc<AuditBuffer>> = self
            .buffers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();

        let mut total = 0;
        for buffer in buffers {
            total += buffer.flush().await;
        }
        total
    }

    /// Stop timers, flush everything, and close writers
    ///
    /// Events enqueued afterwards are flushed immediately.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let buffers: Vec<Arc<AuditBuffer>> = self
            .buffers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();

        for buffer in &buffers {
            buffer.stop_timer();
        }
        let flushed = self.flush_all().await;
        for buffer in &buffers {
            buffer.close_writers().await;
        }
        for writer in &self.extra_writers {
            if let Err(e) = writer.close().await {
                tracing::warn!(writer = writer.name(), error = %e, "Failed to close audit writer");
            }
        }

        tracing::info!(buffers = buffers.len(), flushed, "Audit buffers shut down");
    }

    /// Queued events of one buffer
    pub fn buffered(&self, tenant_id: &str, schema_key: &str) -> usize {
        self.existing(&BufferKey::new(tenant_id, schema_key))
            .map(|b| b.len())
            .unwrap_or(0)
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.read().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Drop for AuditBufferManager {
    fn drop(&mut self) {
        let buffers = self.buffers.get_mut().unwrap_or_else(|p| p.into_inner());
        for buffer in buffers.values() {
            buffer.stop_timer();
        }
    }
}
