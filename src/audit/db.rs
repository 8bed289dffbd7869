//! Batched-insert audit writer backed by the tenant's own store
//!
//! Rows go to the activity model through the raw connection, never through
//! a tenant client, so audit inserts are not themselves intercepted.

use super::AuditWriter;
use crate::config::AuditConfig;
use crate::error::{DbError, Result};
use crate::store::StoreConnection;
use crate::types::{AuditEvent, Operation, OperationKind, QueryArgs};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Model that receives audit rows
pub const ACTIVITY_MODEL: &str = "tb_activity";

/// Writes audit batches into the activity model
pub struct DbAuditWriter {
    connection: Arc<dyn StoreConnection>,
    model: String,
    excluded: HashSet<String>,
}

impl DbAuditWriter {
    pub fn new(connection: Arc<dyn StoreConnection>, config: &AuditConfig) -> Self {
        let mut excluded: HashSet<String> = config.audit_excluded_models.iter().cloned().collect();
        excluded.insert(ACTIVITY_MODEL.to_string());
        Self {
            connection,
            model: ACTIVITY_MODEL.to_string(),
            excluded,
        }
    }

    /// Write into a different model than `tb_activity`
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self.excluded.insert(self.model.clone());
        self
    }

    async fn insert(&self, kind: OperationKind, data: Value) -> Result<Value> {
        self.connection
            .execute(&Operation::new(self.model.clone(), kind, QueryArgs::data(data)))
            .await
    }
}

/// `tb_purchase_request` → `purchase_request`, `creditTerm` → `credit_term`
pub fn entity_type(model: &str) -> String {
    let stripped = model.strip_prefix("tb_").unwrap_or(model);
    let mut out = String::with_capacity(stripped.len() + 4);
    for c in stripped.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out.trim_start_matches('_').to_string()
}

fn valid_uuid(value: Option<&str>) -> Value {
    match value {
        Some(v) if uuid::Uuid::parse_str(v).is_ok() => Value::String(v.to_string()),
        _ => Value::Null,
    }
}

fn description(event: &AuditEvent) -> String {
    match &event.record_id {
        Some(id) => format!("{} on {} ({})", event.action.as_str(), event.model, id),
        None => format!("{} on {}", event.action.as_str(), event.model),
    }
}

/// Activity row for one event
pub fn activity_row(event: &AuditEvent) -> Result<Value> {
    Ok(json!({
        "id": event.id,
        "tenant_id": event.tenant_id,
        "schema_key": event.schema_key,
        "model": event.model,
        "operation": event.operation,
        "action": event.action,
        "actor_id": event.actor_id,
        "before": event.before.clone().unwrap_or_else(|| json!({})),
        "after": event.after.clone().unwrap_or_else(|| json!({})),
        "occurred_at": event.occurred_at,
        "entity_type": entity_type(&event.model),
        "entity_id": valid_uuid(event.record_id.as_deref()),
        "created_by_id": valid_uuid(Some(&event.actor_id)),
        "meta_data": serde_json::to_value(&event.metadata)?,
        "ip_address": event.metadata.ip_address,
        "user_agent": event.metadata.user_agent,
        "description": description(event),
    }))
}

#[async_trait]
impl AuditWriter for DbAuditWriter {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<()> {
        let rows = events
            .iter()
            .filter(|e| !self.excluded.contains(&e.model))
            .map(activity_row)
            .collect::<Result<Vec<_>>>()?;
        if rows.is_empty() {
            return Ok(());
        }

        let total = rows.len();
        match self.insert(OperationKind::CreateMany, Value::Array(rows.clone())).await {
            Ok(_) => {
                tracing::debug!(model = %self.model, count = total, "Audit batch inserted");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(
                    model = %self.model,
                    count = total,
                    error = %e,
                    "Batch audit insert failed, falling back to row inserts"
                );
            }
        }

        let mut failed = 0usize;
        for row in rows {
            if let Err(e) = self.insert(OperationKind::Create, row).await {
                tracing::debug!(model = %self.model, error = %e, "Audit row insert failed");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(DbError::AuditWrite {
                writer: self.name().to_string(),
                reason: format!("{} of {} rows not inserted into {}", failed, total, self.model),
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "database"
    }
}
