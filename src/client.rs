//! Tenant-scoped client handle
//!
//! A `TenantClient` is what business modules receive from the registry.
//! Every operation goes through the tenant's pipeline before reaching the
//! store. Clones share the same underlying connection.

use crate::context::{current_context, with_context};
use crate::error::{DbError, Result};
use crate::pipeline::Pipeline;
use crate::store::StoreConnection;
use crate::types::{Operation, OperationKind, QueryArgs};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

struct ClientInner {
    id: String,
    tenant_id: String,
    schema_key: String,
    connection: Arc<dyn StoreConnection>,
    pipeline: Pipeline,
    created_at: DateTime<Utc>,
}

/// Handle to one tenant's decorated store connection
#[derive(Clone)]
pub struct TenantClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for TenantClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantClient")
            .field("id", &self.inner.id)
            .field("tenant_id", &self.inner.tenant_id)
            .field("schema_key", &self.inner.schema_key)
            .field("stages", &self.inner.pipeline.stage_names())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TenantClient {
    pub(crate) fn new(
        tenant_id: impl Into<String>,
        schema_key: impl Into<String>,
        connection: Arc<dyn StoreConnection>,
        pipeline: Pipeline,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id: format!("conn-{}", uuid::Uuid::new_v4()),
                tenant_id: tenant_id.into(),
                schema_key: schema_key.into(),
                connection,
                pipeline,
                created_at: Utc::now(),
            }),
        }
    }

    /// Unique handle identifier (conn-<uuid>)
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.inner.tenant_id
    }

    pub fn schema_key(&self) -> &str {
        &self.inner.schema_key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Stage names of this handle's pipeline, outermost first
    pub fn stages(&self) -> Vec<String> {
        self.inner.pipeline.stage_names()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.connection.is_closed()
    }

    /// Whether both handles wrap the same connection
    pub fn same_handle(&self, other: &TenantClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn connection(&self) -> Arc<dyn StoreConnection> {
        self.inner.connection.clone()
    }

    pub(crate) async fn close(&self) -> Result<()> {
        self.inner.connection.close().await
    }

    /// Run an operation through the pipeline
    ///
    /// The pipeline runs on its own task carrying the caller's
    /// [`QueryContext`](crate::context::QueryContext). If the caller is
    /// cancelled, an operation that reached the store still finishes and
    /// its audit event is still recorded.
    pub async fn execute(&self, op: Operation) -> Result<Value> {
        if self.is_closed() {
            return Err(DbError::Connection(format!(
                "{} for tenant {} is closed",
                self.inner.id, self.inner.tenant_id
            )));
        }
        tracing::debug!(
            tenant = %self.inner.tenant_id,
            model = %op.model,
            operation = %op.kind,
            "Executing operation"
        );

        let inner = self.inner.clone();
        let context = current_context();
        let task = tokio::spawn(async move {
            let run = inner.pipeline.execute(inner.connection.as_ref(), op);
            match context {
                Some(ctx) => with_context(ctx, run).await,
                None => run.await,
            }
        });

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(DbError::Connection(format!(
                "operation task for tenant {} failed: {}",
                self.inner.tenant_id, e
            ))),
        }
    }

    async fn run(&self, model: &str, kind: OperationKind, args: QueryArgs) -> Result<Value> {
        self.execute(Operation::new(model, kind, args)).await
    }

    pub async fn find_unique(&self, model: &str, filter: Value) -> Result<Value> {
        self.run(model, OperationKind::FindUnique, QueryArgs::filter(filter)).await
    }

    pub async fn find_first(&self, model: &str, filter: Value) -> Result<Value> {
        self.run(model, OperationKind::FindFirst, QueryArgs::filter(filter)).await
    }

    pub async fn find_many(&self, model: &str, filter: Value) -> Result<Vec<Value>> {
        match self.run(model, OperationKind::FindMany, QueryArgs::filter(filter)).await? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Ok(vec![other]),
        }
    }

    pub async fn count(&self, model: &str, filter: Value) -> Result<u64> {
        let value = self.run(model, OperationKind::Count, QueryArgs::filter(filter)).await?;
        value.as_u64().ok_or_else(|| DbError::Query {
            model: model.to_string(),
            operation: OperationKind::Count.to_string(),
            reason: format!("expected a number, got {}", value),
        })
    }

    pub async fn aggregate(&self, model: &str, filter: Value) -> Result<Value> {
        self.run(model, OperationKind::Aggregate, QueryArgs::filter(filter)).await
    }

    pub async fn group_by(&self, model: &str, by: &[&str], filter: Value) -> Result<Value> {
        let args = QueryArgs {
            by: by.iter().map(|s| s.to_string()).collect(),
            ..QueryArgs::filter(filter)
        };
        self.run(model, OperationKind::GroupBy, args).await
    }

    pub async fn create(&self, model: &str, data: Value) -> Result<Value> {
        self.run(model, OperationKind::Create, QueryArgs::data(data)).await
    }

    pub async fn create_many(&self, model: &str, data: Vec<Value>) -> Result<Value> {
        self.run(model, OperationKind::CreateMany, QueryArgs::data(Value::Array(data)))
            .await
    }

    pub async fn update(&self, model: &str, filter: Value, data: Value) -> Result<Value> {
        let args = QueryArgs {
            data: Some(data),
            ..QueryArgs::filter(filter)
        };
        self.run(model, OperationKind::Update, args).await
    }

    pub async fn update_many(&self, model: &str, filter: Value, data: Value) -> Result<Value> {
        let args = QueryArgs {
            data: Some(data),
            ..QueryArgs::filter(filter)
        };
        self.run(model, OperationKind::UpdateMany, args).await
    }

    pub async fn upsert(&self, model: &str, filter: Value, create: Value, update: Value) -> Result<Value> {
        let args = QueryArgs {
            create: Some(create),
            update: Some(update),
            ..QueryArgs::filter(filter)
        };
        self.run(model, OperationKind::Upsert, args).await
    }

    pub async fn delete(&self, model: &str, filter: Value) -> Result<Value> {
        self.run(model, OperationKind::Delete, QueryArgs::filter(filter)).await
    }

    pub async fn delete_many(&self, model: &str, filter: Value) -> Result<Value> {
        self.run(model, OperationKind::DeleteMany, QueryArgs::filter(filter)).await
    }
}
