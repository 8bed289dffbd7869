//! Query interception pipeline
//!
//! A pipeline is a fixed, ordered list of stages wrapped around a store
//! connection. Each stage receives the operation and a [`Next`] handle;
//! it may rewrite the operation before calling `next.run(op)` and inspect
//! the result afterwards. The first stage is the outermost.
//!
//! ```text
//! SoftDeleteFilter -> InputNormalizer -> AuditCapture -> StoreConnection
//! ```

use crate::error::Result;
use crate::store::StoreConnection;
use crate::types::Operation;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub mod audit;
pub mod normalize;
pub mod soft_delete;

pub use audit::AuditCapture;
pub use normalize::{trim_strings, InputNormalizer};
pub use soft_delete::SoftDeleteFilter;

/// One cross-cutting behavior applied to every operation
#[async_trait]
pub trait Stage: Send + Sync {
    /// Handle `op`, delegating to the rest of the pipeline through `next`
    async fn handle(&self, op: Operation, next: Next<'_>) -> Result<Value>;

    /// Stage name for diagnostics
    fn name(&self) -> &str;
}

/// The remainder of a pipeline, ending at the store connection
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
    connection: &'a dyn StoreConnection,
}

impl<'a> Next<'a> {
    /// Run the remaining stages and then the store
    pub async fn run(self, op: Operation) -> Result<Value> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    stages: rest,
                    connection: self.connection,
                };
                stage.handle(op, next).await
            }
            None => self.connection.execute(&op).await,
        }
    }

    /// The undecorated connection, for stages that need a side read
    pub fn connection(&self) -> &'a dyn StoreConnection {
        self.connection
    }
}

/// An ordered, immutable list of stages
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage (it runs inside every stage added before it)
    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Append a stage shared with other pipelines
    pub fn with_shared_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Execute `op` through every stage against `connection`
    pub async fn execute(&self, connection: &dyn StoreConnection, op: Operation) -> Result<Value> {
        Next {
            stages: &self.stages,
            connection,
        }
        .run(op)
        .await
    }

    /// Stage names in execution order
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
