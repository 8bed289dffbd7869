//! Soft-delete filtering for read operations

use super::{Next, Stage};
use crate::error::Result;
use crate::types::Operation;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;

/// Hides logically deleted rows from every read-family operation
///
/// Injects `<marker>: null` into the filter unless the model has no marker
/// (listed in the exemption set) or the caller already filters on it.
pub struct SoftDeleteFilter {
    marker: String,
    exempt: HashSet<String>,
}

impl SoftDeleteFilter {
    pub fn new(marker: impl Into<String>, exempt: impl IntoIterator<Item = String>) -> Self {
        Self {
            marker: marker.into(),
            exempt: exempt.into_iter().collect(),
        }
    }

    /// Rewrite `op` in place; returns whether the filter was injected
    pub fn apply(&self, op: &mut Operation) -> bool {
        if !op.kind.is_read()
            || self.exempt.contains(&op.model)
            || op.args.filter_references(&self.marker)
        {
            return false;
        }
        op.args
            .filter
            .get_or_insert_with(Default::default)
            .insert(self.marker.clone(), Value::Null);
        true
    }
}

#[async_trait]
impl Stage for SoftDeleteFilter {
    async fn handle(&self, mut op: Operation, next: Next<'_>) -> Result<Value> {
        if self.apply(&mut op) {
            tracing::trace!(model = %op.model, operation = %op.kind, "Soft-delete filter applied");
        }
        next.run(op).await
    }

    fn name(&self) -> &str {
        "soft_delete"
    }
}
