//! Core operation and audit types for the tenant data layer
//!
//! Row data, filters, and audit snapshots are `serde_json::Value` objects
//! with insertion order preserved, so snapshots serialize in the same field
//! order the store returned them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Store operation categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    FindUnique,
    FindUniqueOrThrow,
    FindFirst,
    FindFirstOrThrow,
    FindMany,
    Count,
    Aggregate,
    GroupBy,
    Create,
    CreateMany,
    Update,
    UpdateMany,
    Upsert,
    Delete,
    DeleteMany,
}

impl OperationKind {
    /// Lookups and reductions subject to soft-delete filtering
    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::FindUnique
                | Self::FindUniqueOrThrow
                | Self::FindFirst
                | Self::FindFirstOrThrow
                | Self::FindMany
                | Self::Count
                | Self::Aggregate
                | Self::GroupBy
        )
    }

    /// Operations carrying a payload to normalize
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::Create | Self::CreateMany | Self::Update | Self::UpdateMany | Self::Upsert
        )
    }

    /// Operations that mutate rows and are audited
    pub fn is_mutation(self) -> bool {
        self.is_write() || matches!(self, Self::Delete | Self::DeleteMany)
    }

    /// Audit action recorded for a mutation
    pub fn audit_action(self) -> Option<AuditAction> {
        match self {
            Self::Create | Self::CreateMany => Some(AuditAction::Create),
            Self::Update | Self::UpdateMany | Self::Upsert => Some(AuditAction::Update),
            Self::Delete | Self::DeleteMany => Some(AuditAction::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FindUnique => "find_unique",
            Self::FindUniqueOrThrow => "find_unique_or_throw",
            Self::FindFirst => "find_first",
            Self::FindFirstOrThrow => "find_first_or_throw",
            Self::FindMany => "find_many",
            Self::Count => "count",
            Self::Aggregate => "aggregate",
            Self::GroupBy => "group_by",
            Self::Create => "create",
            Self::CreateMany => "create_many",
            Self::Update => "update",
            Self::UpdateMany => "update_many",
            Self::Upsert => "upsert",
            Self::Delete => "delete",
            Self::DeleteMany => "delete_many",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of a store operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryArgs {
    /// Row predicate: field → value, or field → `{"not": v}` / `{"in": [..]}`
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Map<String, Value>>,

    /// Payload for create/update (object) or create_many (array of objects)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Upsert insert branch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<Value>,

    /// Upsert update branch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Value>,

    /// Grouping fields for `GroupBy`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub by: Vec<String>,
}

impl QueryArgs {
    /// Args with only a filter
    pub fn filter(filter: Value) -> Self {
        Self {
            filter: into_object(filter),
            ..Default::default()
        }
    }

    /// Args with only a data payload
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    /// Whether the caller's filter names `field` at the top level
    pub fn filter_references(&self, field: &str) -> bool {
        self.filter
            .as_ref()
            .map(|f| f.contains_key(field))
            .unwrap_or(false)
    }

    /// Filter as a JSON value (`{}` when absent)
    pub fn filter_value(&self) -> Value {
        Value::Object(self.filter.clone().unwrap_or_default())
    }
}

fn into_object(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        Value::Null => None,
        other => {
            tracing::debug!(filter = %other, "Ignoring non-object filter");
            None
        }
    }
}

/// A single operation issued against one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Model (table) name, e.g. `tb_product`
    pub model: String,

    pub kind: OperationKind,

    pub args: QueryArgs,
}

impl Operation {
    pub fn new(model: impl Into<String>, kind: OperationKind, args: QueryArgs) -> Self {
        Self {
            model: model.into(),
            kind,
            args,
        }
    }
}

/// Coarse action recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Request metadata copied into an audit event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Durable record of one data mutation
///
/// Immutable once built. Serialized field names are the persisted record
/// layout shared by every audit writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event identifier (aud-<uuid>)
    pub id: String,

    pub tenant_id: String,

    pub schema_key: String,

    pub model: String,

    /// Precise store operation (e.g. `create_many`)
    pub operation: OperationKind,

    pub action: AuditAction,

    /// Actor from the request context, `system` when none was established
    pub actor_id: String,

    /// `id`/`uuid` of the affected row when a single row was touched
    #[serde(default)]
    pub record_id: Option<String>,

    /// State before the mutation, when known
    #[serde(default)]
    pub before: Option<Value>,

    /// State after the mutation (the operation result)
    #[serde(default)]
    pub after: Option<Value>,

    #[serde(default)]
    pub metadata: AuditMetadata,

    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    /// Create an event with auto-generated id and timestamp
    pub fn new(
        tenant_id: impl Into<String>,
        schema_key: impl Into<String>,
        model: impl Into<String>,
        operation: OperationKind,
        action: AuditAction,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("aud-{}", uuid::Uuid::new_v4()),
            tenant_id: tenant_id.into(),
            schema_key: schema_key.into(),
            model: model.into(),
            operation,
            action,
            actor_id: actor_id.into(),
            record_id: None,
            before: None,
            after: None,
            metadata: AuditMetadata::default(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_before(mut self, before: Option<Value>) -> Self {
        self.before = before;
        self
    }

    pub fn with_after(mut self, after: Option<Value>) -> Self {
        self.after = after;
        self
    }

    pub fn with_record_id(mut self, record_id: Option<String>) -> Self {
        self.record_id = record_id;
        self
    }

    pub fn with_metadata(mut self, metadata: AuditMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Extract a row identifier from an operation result (`id`, then `uuid`)
pub fn extract_record_id(result: &Value) -> Option<String> {
    let obj = result.as_object()?;
    ["id", "uuid"].iter().find_map(|key| match obj.get(*key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
