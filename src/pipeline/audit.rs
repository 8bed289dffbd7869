//! Audit capture stage
//!
//! Runs mutations, then records an [`AuditEvent`] describing them. The
//! caller's result is returned whether or not the event could be recorded.

use super::{Next, Stage};
use crate::audit::AuditBufferManager;
use crate::context::current_context;
use crate::error::Result;
use crate::types::{extract_record_id, AuditAction, AuditEvent, Operation, OperationKind, QueryArgs};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Actor recorded when no request context is active
pub const SYSTEM_ACTOR: &str = "system";

/// Emits one audit event per mutation into the tenant's buffer
pub struct AuditCapture {
    tenant_id: String,
    schema_key: String,
    audit: Arc<AuditBufferManager>,
}

impl AuditCapture {
    pub fn new(
        tenant_id: impl Into<String>,
        schema_key: impl Into<String>,
        audit: Arc<AuditBufferManager>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            schema_key: schema_key.into(),
            audit,
        }
    }

    fn captures(&self, op: &Operation) -> bool {
        op.kind.is_mutation() && !self.audit.config().is_audit_excluded(&op.model)
    }

    /// Current row for single-row updates
    ///
    /// `None` when no snapshot was taken, `Some(Value::Null)` when the row
    /// did not exist yet.
    async fn snapshot(&self, op: &Operation, next: &Next<'_>) -> Option<Value> {
        if !self.audit.config().snapshot_before
            || !matches!(op.kind, OperationKind::Update | OperationKind::Upsert)
        {
            return None;
        }

        let lookup = Operation::new(
            op.model.clone(),
            OperationKind::FindFirst,
            QueryArgs {
                filter: op.args.filter.clone(),
                ..Default::default()
            },
        );
        match next.connection().execute(&lookup).await {
            Ok(row) => Some(row),
            Err(e) => {
                tracing::debug!(model = %op.model, error = %e, "Before-state snapshot failed");
                None
            }
        }
    }

    /// Build the event for a completed mutation
    pub fn build_event(&self, op: &Operation, result: &Value, snapshot: Option<Value>) -> AuditEvent {
        let filter = json!({ "where": op.args.filter_value() });
        let data = op.args.data.clone().unwrap_or(Value::Null);
        let count = result.get("count").cloned().unwrap_or(Value::Null);

        let (action, before, after, record_id) = match op.kind {
            OperationKind::Create => (AuditAction::Create, None, Some(result.clone()), extract_record_id(result)),
            OperationKind::CreateMany => (
                AuditAction::Create,
                None,
                Some(json!({ "count": count, "data": data })),
                None,
            ),
            OperationKind::Upsert if snapshot.as_ref().map(Value::is_null).unwrap_or(false) => {
                (AuditAction::Create, None, Some(result.clone()), extract_record_id(result))
            }
            OperationKind::Update | OperationKind::Upsert => (
                AuditAction::Update,
                Some(snapshot.unwrap_or(filter)),
                Some(result.clone()),
                extract_record_id(result),
            ),
            OperationKind::UpdateMany => (
                AuditAction::Update,
                Some(filter),
                Some(json!({ "count": count, "data": data })),
                None,
            ),
            OperationKind::Delete => (AuditAction::Delete, Some(result.clone()), None, extract_record_id(result)),
            OperationKind::DeleteMany => (
                AuditAction::Delete,
                Some(filter),
                Some(json!({ "count": count })),
                None,
            ),
            _ => (AuditAction::Update, None, Some(result.clone()), None),
        };

        let (actor, metadata) = match current_context() {
            Some(ctx) => (ctx.actor_id.clone(), ctx.metadata()),
            None => (SYSTEM_ACTOR.to_string(), Default::default()),
        };

        AuditEvent::new(&self.tenant_id, &self.schema_key, &op.model, op.kind, action, actor)
            .with_before(before)
            .with_after(after)
            .with_record_id(record_id)
            .with_metadata(metadata)
    }
}

#[async_trait]
impl Stage for AuditCapture {
    async fn handle(&self, op: Operation, next: Next<'_>) -> Result<Value> {
        if !self.captures(&op) {
            return next.run(op).await;
        }

        let snapshot = self.snapshot(&op, &next).await;
        let recorded = op.clone();
        let result = next.run(op).await?;

        let event = self.build_event(&recorded, &result, snapshot);
        if let Err(e) = self.audit.enqueue(&self.tenant_id, &self.schema_key, event).await {
            tracing::warn!(
                tenant = %self.tenant_id,
                model = %recorded.model,
                operation = %recorded.kind,
                error = %e,
                "Failed to record audit event"
            );
        }
        Ok(result)
    }

    fn name(&self) -> &str {
        "audit"
    }
}
