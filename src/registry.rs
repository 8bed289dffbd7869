//! Per-tenant connection registry
//!
//! Caches one decorated client per tenant. A cached client is reused while
//! its configuration fingerprint matches and the connection is alive;
//! otherwise the old connection is closed and a new one is built. Creation
//! for one tenant is single-flight: concurrent callers wait on a per-tenant
//! lock and then pick up the client the first caller created. Lookups of
//! healthy cached clients only take a shared read lock, and tenants never
//! contend on each other's locks.

use crate::audit::{AuditBufferManager, DbAuditWriter};
use crate::client::TenantClient;
use crate::config::ConnectionConfig;
use crate::error::{DbError, Result};
use crate::pipeline::{AuditCapture, InputNormalizer, Pipeline, SoftDeleteFilter, Stage};
use crate::store::{StoreConnection, StoreDriver};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;

type TenantLock = Arc<tokio::sync::Mutex<()>>;
type TenantGuard = OwnedMutexGuard<()>;

/// Cached client of one tenant
#[derive(Debug, Clone)]
pub struct TenantConnectionEntry {
    pub tenant_id: String,
    /// Identity of the configuration the handle was built from
    pub config_fingerprint: String,
    pub handle: TenantClient,
    pub created_at: DateTime<Utc>,
}

/// Owns every tenant's connection for the life of the process
pub struct ConnectionRegistry {
    driver: Arc<dyn StoreDriver>,
    audit: Arc<AuditBufferManager>,
    entries: RwLock<HashMap<String, TenantConnectionEntry>>,
    locks: Mutex<HashMap<String, TenantLock>>,
    extra_stages: Vec<Arc<dyn Stage>>,
}

impl ConnectionRegistry {
    pub fn new(driver: impl StoreDriver + 'static, audit: Arc<AuditBufferManager>) -> Self {
        Self {
            driver: Arc::new(driver),
            audit,
            entries: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            extra_stages: Vec::new(),
        }
    }

    /// Add a stage to every client built from now on
    ///
    /// Extra stages run innermost, after audit capture and right before
    /// the store.
    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.extra_stages.push(Arc::new(stage));
        self
    }

    pub fn audit(&self) -> &Arc<AuditBufferManager> {
        &self.audit
    }

    fn lock_error(e: impl std::fmt::Display) -> DbError {
        DbError::Connection(format!("registry lock poisoned: {}", e))
    }

    fn tenant_lock(&self, tenant_id: &str) -> Result<TenantLock> {
        let mut locks = self.locks.lock().map_err(Self::lock_error)?;
        Ok(locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    fn entry(&self, tenant_id: &str) -> Result<Option<TenantConnectionEntry>> {
        let entries = self.entries.read().map_err(Self::lock_error)?;
        Ok(entries.get(tenant_id).cloned())
    }

    fn remove(&self, tenant_id: &str) -> Result<Option<TenantConnectionEntry>> {
        let mut entries = self.entries.write().map_err(Self::lock_error)?;
        Ok(entries.remove(tenant_id))
    }

    /// Get the tenant's client, creating or replacing it as needed
    ///
    /// Fails with `Connection` when the store is unreachable and with
    /// `Timeout` when connecting exceeds the configured timeout. A failed
    /// creation leaves no entry behind.
    pub async fn obtain(&self, tenant_id: &str, config: &ConnectionConfig) -> Result<TenantClient> {
        let fingerprint = config.fingerprint();

        if let Some(entry) = self.entry(tenant_id)? {
            if entry.config_fingerprint == fingerprint
                && entry.handle.connection().ensure_connected().await.is_ok()
            {
                return Ok(entry.handle);
            }
        }

        let mut guard = self.tenant_lock(tenant_id)?.lock_owned().await;

        // another caller may have finished creating while we waited
        if let Some(entry) = self.entry(tenant_id)? {
            if entry.config_fingerprint == fingerprint {
                match entry.handle.connection().ensure_connected().await {
                    Ok(()) => return Ok(entry.handle),
                    Err(e) => tracing::warn!(
                        tenant = %tenant_id,
                        connection = %entry.handle.id(),
                        error = %e,
                        "Cached connection is dead, reconnecting"
                    ),
                }
            } else {
                tracing::info!(
                    tenant = %tenant_id,
                    connection = %entry.handle.id(),
                    "Connection config changed, replacing connection"
                );
            }
            guard = self.retire(entry, guard).await?;
        }

        let handle = self.create(tenant_id, config).await?;
        let entry = TenantConnectionEntry {
            tenant_id: tenant_id.to_string(),
            config_fingerprint: fingerprint.to_string(),
            handle: handle.clone(),
            created_at: handle.created_at(),
        };
        self.entries
            .write()
            .map_err(Self::lock_error)?
            .insert(tenant_id.to_string(), entry);
        drop(guard);

        Ok(handle)
    }

    /// Drop an entry: flush its pending audit events, then close it
    ///
    /// Runs on its own task holding the tenant lock, so a cancelled caller
    /// cannot leave the forgotten connection open. The guard is handed back
    /// once the connection is closed.
    async fn retire(&self, entry: TenantConnectionEntry, guard: TenantGuard) -> Result<TenantGuard> {
        self.remove(&entry.tenant_id)?;
        let audit = self.audit.clone();
        let tenant_id = entry.tenant_id.clone();

        tokio::spawn(async move {
            audit
                .flush(&entry.tenant_id, entry.handle.schema_key())
                .await;
            if let Err(e) = entry.handle.close().await {
                tracing::warn!(
                    tenant = %entry.tenant_id,
                    connection = %entry.handle.id(),
                    error = %e,
                    "Failed to close connection"
                );
            }
            guard
        })
        .await
        .map_err(|e| {
            DbError::Connection(format!("retiring connection of tenant {} failed: {}", tenant_id, e))
        })
    }

    /// Forget the tenant's lock unless someone else is holding or awaiting it
    fn prune_lock(&self, tenant_id: &str) {
        if let Ok(mut locks) = self.locks.lock() {
            if locks
                .get(tenant_id)
                .map(|lock| Arc::strong_count(lock) == 1)
                .unwrap_or(false)
            {
                locks.remove(tenant_id);
            }
        }
    }

    async fn create(&self, tenant_id: &str, config: &ConnectionConfig) -> Result<TenantClient> {
        let timeout = config.connect_timeout();
        let connection = tokio::time::timeout(timeout, self.driver.connect(config))
            .await
            .map_err(|_| {
                DbError::Timeout(format!(
                    "connecting tenant {} took longer than {}ms",
                    tenant_id,
                    timeout.as_millis()
                ))
            })??;
        let connection: Arc<dyn StoreConnection> = Arc::from(connection);

        let schema_key = config.schema_key();
        if self.audit.config().save_to_database {
            let writer = DbAuditWriter::new(connection.clone(), self.audit.config());
            self.audit
                .attach_database_writer(tenant_id, &schema_key, Arc::new(writer));
        }

        let pipeline = self.build_pipeline(tenant_id, &schema_key);
        let handle = TenantClient::new(tenant_id, schema_key.as_str(), connection, pipeline);

        tracing::info!(
            tenant = %tenant_id,
            schema = %schema_key,
            connection = %handle.id(),
            driver = self.driver.name(),
            "Tenant connection created"
        );
        Ok(handle)
    }

    fn build_pipeline(&self, tenant_id: &str, schema_key: &str) -> Pipeline {
        let config = self.audit.config();
        let mut pipeline = Pipeline::new()
            .with_stage(SoftDeleteFilter::new(
                config.soft_delete_field.clone(),
                config.excluded_models.iter().cloned(),
            ))
            .with_stage(InputNormalizer)
            .with_stage(AuditCapture::new(tenant_id, schema_key, self.audit.clone()));
        for stage in &self.extra_stages {
            pipeline = pipeline.with_shared_stage(stage.clone());
        }
        pipeline
    }

    /// Close and forget a tenant's connection; returns whether one existed
    pub async fn evict(&self, tenant_id: &str) -> Result<bool> {
        let guard = self.tenant_lock(tenant_id)?.lock_owned().await;

        let evicted = match self.entry(tenant_id)? {
            Some(entry) => {
                drop(self.retire(entry, guard).await?);
                tracing::info!(tenant = %tenant_id, "Tenant connection evicted");
                true
            }
            None => {
                drop(guard);
                false
            }
        };
        self.prune_lock(tenant_id);
        Ok(evicted)
    }

    /// Flush and close the audit trail, then close every connection
    pub async fn shutdown(&self) -> Result<()> {
        self.audit.shutdown().await;

        let entries: Vec<TenantConnectionEntry> = {
            let mut entries = self.entries.write().map_err(Self::lock_error)?;
            entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = entries.len();

        // the drained entries are no longer reachable, so close them even if
        // the caller goes away
        tokio::spawn(async move {
            for entry in entries {
                if let Err(e) = entry.handle.close().await {
                    tracing::warn!(
                        tenant = %entry.tenant_id,
                        error = %e,
                        "Failed to close connection during shutdown"
                    );
                }
            }
        })
        .await
        .map_err(|e| DbError::Connection(format!("closing connections failed: {}", e)))?;

        if let Ok(mut locks) = self.locks.lock() {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }

        tracing::info!(connections = count, "Connection registry shut down");
        Ok(())
    }

    /// Fingerprint of the tenant's cached connection
    pub fn fingerprint(&self, tenant_id: &str) -> Option<String> {
        self.entry(tenant_id)
            .ok()
            .flatten()
            .map(|e| e.config_fingerprint)
    }

    pub fn contains(&self, tenant_id: &str) -> bool {
        self.fingerprint(tenant_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditWriter, MemoryAuditWriter};
    use crate::config::AuditConfig;
    use crate::context::{with_context, QueryContext};
    use crate::pipeline::Next;
    use crate::store::memory::MemoryDriver;
    use crate::types::{AuditEvent, Operation};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    /// Writer that takes a while to persist each batch
    struct SlowWriter(Duration);

    #[async_trait]
    impl AuditWriter for SlowWriter {
        async fn write_batch(&self, _events: &[AuditEvent]) -> Result<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    /// Stage that holds the result for a while after the store answered
    struct SlowAck(Duration);

    #[async_trait]
    impl Stage for SlowAck {
        async fn handle(&self, op: Operation, next: Next<'_>) -> Result<Value> {
            let result = next.run(op).await;
            tokio::time::sleep(self.0).await;
            result
        }

        fn name(&self) -> &str {
            "slow_ack"
        }
    }

    fn registry(driver: &MemoryDriver) -> ConnectionRegistry {
        let audit = AuditBufferManager::new(AuditConfig {
            save_to_database: false,
            ..Default::default()
        });
        ConnectionRegistry::new(driver.clone(), Arc::new(audit))
    }

    #[tokio::test]
    async fn test_same_config_returns_same_handle() {
        let driver = MemoryDriver::new();
        let registry = registry(&driver);
        let config = ConnectionConfig::new("memory://a");

        let first = registry.obtain("T1", &config).await.unwrap();
        let second = registry.obtain("T1", &config).await.unwrap();
        assert!(first.same_handle(&second));
        assert_eq!(driver.connections_opened(), 1);
        assert_eq!(registry.fingerprint("T1").as_deref(), Some("memory://a"));
    }

    #[tokio::test]
    async fn test_tenants_get_distinct_handles() {
        let driver = MemoryDriver::new();
        let registry = registry(&driver);
        let config = ConnectionConfig::new("memory://shared");

        let t1 = registry.obtain("T1", &config).await.unwrap();
        let t2 = registry.obtain("T2", &config).await.unwrap();
        assert!(!t1.same_handle(&t2));
        assert_eq!(registry.len(), 2);
        assert_eq!(driver.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_config_change_replaces_and_closes() {
        let driver = MemoryDriver::new();
        let registry = registry(&driver);

        let old = registry.obtain("T1", &ConnectionConfig::new("memory://a")).await.unwrap();
        let new = registry.obtain("T1", &ConnectionConfig::new("memory://b")).await.unwrap();

        assert!(!old.same_handle(&new));
        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert_eq!(registry.len(), 1);

        let err = old.count("tb_unit", json!({})).await.unwrap_err();
        assert!(matches!(err, DbError::Connection(_)));
    }

    #[tokio::test]
    async fn test_concurrent_obtain_is_single_flight() {
        let driver = MemoryDriver::new().with_connect_delay(Duration::from_millis(50));
        let registry = Arc::new(registry(&driver));
        let config = ConnectionConfig::new("memory://slow");

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let registry = registry.clone();
            let config = config.clone();
            tasks.push(tokio::spawn(async move { registry.obtain("T1", &config).await }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }

        assert_eq!(driver.connections_opened(), 1);
        assert!(handles.windows(2).all(|w| w[0].same_handle(&w[1])));
    }

    #[tokio::test]
    async fn test_unreachable_store_leaves_no_entry() {
        let driver = MemoryDriver::new();
        driver.set_unreachable("memory://down", true);
        let registry = registry(&driver);

        let err = registry
            .obtain("T1", &ConnectionConfig::new("memory://down"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connection(_)));
        assert!(!registry.contains("T1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let driver = MemoryDriver::new().with_connect_delay(Duration::from_secs(30));
        let registry = registry(&driver);
        let config = ConnectionConfig::new("memory://slow").with_connect_timeout(Duration::from_millis(100));

        let err = registry.obtain("T1", &config).await.unwrap_err();
        assert!(matches!(err, DbError::Timeout(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dead_connection_is_rebuilt() {
        let driver = MemoryDriver::new();
        let registry = registry(&driver);
        let config = ConnectionConfig::new("memory://a");

        let first = registry.obtain("T1", &config).await.unwrap();
        first.close().await.unwrap();

        let second = registry.obtain("T1", &config).await.unwrap();
        assert!(!first.same_handle(&second));
        assert!(!second.is_closed());
        assert_eq!(driver.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_evict_and_shutdown() {
        let driver = MemoryDriver::new();
        let registry = registry(&driver);
        let t1 = registry.obtain("T1", &ConnectionConfig::new("memory://a")).await.unwrap();
        let t2 = registry.obtain("T2", &ConnectionConfig::new("memory://b")).await.unwrap();

        assert!(registry.evict("T1").await.unwrap());
        assert!(!registry.evict("T1").await.unwrap());
        assert!(t1.is_closed());

        registry.shutdown().await.unwrap();
        assert!(t2.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_stages_and_db_audit() {
        let driver = MemoryDriver::new();
        let sink = MemoryAuditWriter::new();
        let audit = AuditBufferManager::new(AuditConfig::default()).with_writer(sink.clone());
        let registry = ConnectionRegistry::new(driver.clone(), Arc::new(audit));

        let client = registry
            .obtain("T1", &ConnectionConfig::new("memory://db?schema=tenant_a"))
            .await
            .unwrap();
        assert_eq!(client.schema_key(), "tenant_a");
        assert_eq!(client.stages(), vec!["soft_delete", "normalize", "audit"]);

        client.create("tb_unit", json!({"name": "kg"})).await.unwrap();
        registry.audit().flush_all().await;

        let activity = driver.database("memory://db?schema=tenant_a").rows("tb_activity");
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0]["entity_type"], "unit");
        assert_eq!(sink.count().await, 1);
        // audit rows are written around the pipeline, so they are not audited again
        registry.audit().flush_all().await;
        assert_eq!(sink.count().await, 1);
    }

    #[tokio::test]
    async fn test_cancelled_replacement_still_closes_old_connection() {
        let driver = MemoryDriver::new();
        let audit = AuditBufferManager::new(AuditConfig {
            save_to_database: false,
            ..Default::default()
        })
        .with_writer(SlowWriter(Duration::from_millis(200)));
        let registry = ConnectionRegistry::new(driver.clone(), Arc::new(audit));

        let old = registry.obtain("T1", &ConnectionConfig::new("memory://a")).await.unwrap();
        old.create("tb_unit", json!({"n": 1})).await.unwrap();

        // gives up while the pending audit batch of the old connection is flushing
        let replaced = tokio::time::timeout(
            Duration::from_millis(50),
            registry.obtain("T1", &ConnectionConfig::new("memory://b")),
        )
        .await;
        assert!(replaced.is_err());

        let new = registry.obtain("T1", &ConnectionConfig::new("memory://b")).await.unwrap();
        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert!(!old.same_handle(&new));
        assert_eq!(driver.connections_opened(), 2);

        let err = old.create("tb_unit", json!({"n": 2})).await.unwrap_err();
        assert!(matches!(err, DbError::Connection(_)));
        assert_eq!(driver.database("memory://a").rows("tb_unit").len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_write_is_still_audited() {
        let driver = MemoryDriver::new();
        let sink = MemoryAuditWriter::new();
        let audit = AuditBufferManager::new(AuditConfig {
            save_to_database: false,
            ..Default::default()
        })
        .with_writer(sink.clone());
        let registry = ConnectionRegistry::new(driver.clone(), Arc::new(audit))
            .with_stage(SlowAck(Duration::from_millis(200)));
        let client = registry.obtain("T1", &ConnectionConfig::new("memory://c")).await.unwrap();
        assert_eq!(client.stages(), vec!["soft_delete", "normalize", "audit", "slow_ack"]);

        let outcome = with_context(
            QueryContext::new("T1", "alice"),
            tokio::time::timeout(
                Duration::from_millis(50),
                client.create("tb_order", json!({"customer": "Acme"})),
            ),
        )
        .await;
        assert!(outcome.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        registry.audit().flush_all().await;

        assert_eq!(driver.database("memory://c").rows("tb_order").len(), 1);
        let events = sink.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor_id, "alice");
        assert_eq!(events[0].after.as_ref().unwrap()["customer"], "Acme");
    }

    #[tokio::test]
    async fn test_tenant_locks_pruned_on_evict_and_shutdown() {
        let driver = MemoryDriver::new();
        let registry = registry(&driver);
        registry.obtain("T1", &ConnectionConfig::new("memory://a")).await.unwrap();
        registry.obtain("T2", &ConnectionConfig::new("memory://b")).await.unwrap();
        assert_eq!(registry.locks.lock().unwrap().len(), 2);

        registry.evict("T1").await.unwrap();
        assert!(!registry.locks.lock().unwrap().contains_key("T1"));

        registry.evict("T9").await.unwrap();
        assert!(!registry.locks.lock().unwrap().contains_key("T9"));

        registry.shutdown().await.unwrap();
        assert!(registry.locks.lock().unwrap().is_empty());
    }
}
